// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Resource sealing rules.
//!
//! Bundles seal their resource files against regex-style rules describing
//! which files matter, how much, and whether they may be absent. Disk
//! representations contribute defaults and adjustments; actual sealing and
//! verification are performed by consumers of the built rule set.

/// A single resource rule.
///
/// The pattern is a regular expression matched against bundle-relative
/// paths.
#[derive(Clone, Debug, PartialEq)]
pub struct ResourceRule {
    /// Regular expression for paths this rule covers.
    pub pattern: String,
    /// Precedence among overlapping rules. Higher weight wins.
    pub weight: Option<u32>,
    /// Matching files are not sealed at all.
    pub omit: bool,
    /// Matching files may be missing at verification time.
    pub optional: bool,
    /// Matching directories hold nested code, sealed by their own signature.
    pub nested: bool,
}

impl ResourceRule {
    pub fn new(pattern: impl ToString) -> Self {
        Self {
            pattern: pattern.to_string(),
            weight: None,
            omit: false,
            optional: false,
            nested: false,
        }
    }

    pub fn weight(mut self, weight: u32) -> Self {
        self.weight = Some(weight);
        self
    }

    pub fn omit(mut self) -> Self {
        self.omit = true;
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn nested(mut self) -> Self {
        self.nested = true;
        self
    }
}

/// Collects resource rules and exclusions for a bundle being sealed.
///
/// A disk representation seeds this with its defaults, then gets a chance
/// to adjust the set (typically to exclude its own signature artifacts)
/// before the caller consumes it.
#[derive(Clone, Debug, Default)]
pub struct ResourceBuilder {
    rules: Vec<ResourceRule>,
    exclusions: Vec<String>,
}

impl ResourceBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_rule(&mut self, rule: ResourceRule) {
        self.rules.push(rule);
    }

    /// Exclude paths matching a pattern from sealing entirely.
    pub fn add_exclusion(&mut self, pattern: impl ToString) {
        self.exclusions.push(pattern.to_string());
    }

    pub fn rules(&self) -> &[ResourceRule] {
        &self.rules
    }

    pub fn exclusions(&self) -> &[String] {
        &self.exclusions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rule_builder_chaining() {
        let rule = ResourceRule::new("^Resources/.*\\.lproj/").weight(1000).optional();
        assert_eq!(rule.weight, Some(1000));
        assert!(rule.optional);
        assert!(!rule.omit);
        assert!(!rule.nested);
    }

    #[test]
    fn builder_accumulates() {
        let mut builder = ResourceBuilder::new();
        builder.add_rule(ResourceRule::new("^Resources/"));
        builder.add_rule(ResourceRule::new("^PlugIns/").nested().weight(10));
        builder.add_exclusion("^_CodeSignature/");

        assert_eq!(builder.rules().len(), 2);
        assert!(builder.rules()[1].nested);
        assert_eq!(builder.exclusions(), &["^_CodeSignature/".to_string()]);
    }
}
