//! Access gate: capability checks and per-argument authorization.
//!
//! Two questions are asked for each operation: does the user hold the
//! capability at all, and is the user authorized for these specific
//! arguments. Rules come from each user's `auth_rules` config entries of the
//! form `CapName(p1,p2,…)`, where patterns are `*`-wildcard strings matched
//! in full against the operation arguments. When authorization is disabled
//! server-wide both questions answer yes.

use std::collections::HashMap;

use regex::Regex;

pub const CAP_BRANCH_CREATE: &str = "CapBranchCreate";
pub const CAP_BRANCH_TAG: &str = "CapBranchTag";
pub const CAP_BRANCH_SWITCH: &str = "CapBranchSwitch";
pub const CAP_BRANCH_LIST: &str = "CapBranchList";
pub const CAP_RES_GROUP_ADD: &str = "CapResGroupAdd";
pub const CAP_RES_GROUP_CHANGE: &str = "CapResGroupChange";
pub const CAP_RES_GROUP_REMOVE: &str = "CapResGroupRemove";
pub const CAP_RES_GROUP_READ: &str = "CapResGroupRead";
pub const CAP_RESOURCE_ADD: &str = "CapResourceAdd";
pub const CAP_RESOURCE_READ: &str = "CapResourceRead";
pub const CAP_RESOURCE_CHANGE: &str = "CapResourceChange";
pub const CAP_RESOURCE_REMOVE: &str = "CapResourceRemove";
pub const CAP_LINK_ADD: &str = "CapLinkAdd";
pub const CAP_LINK_READ: &str = "CapLinkRead";
pub const CAP_LINK_REMOVE: &str = "CapLinkRemove";
pub const CAP_LINK_MARK_CLEAN: &str = "CapLinkMarkClean";

/// One granted capability: a name plus one anchored pattern per argument.
#[derive(Debug, Clone)]
pub struct Capability {
    pub name: String,
    pub patterns: Vec<String>,
    regexes: Vec<Regex>,
}

impl Capability {
    pub fn new(name: &str, patterns: Vec<String>) -> Option<Capability> {
        let mut regexes = Vec::with_capacity(patterns.len());
        for pattern in &patterns {
            // `*` wildcards, everything else literal, full match
            let escaped = regex::escape(pattern).replace("\\*", ".*");
            regexes.push(Regex::new(&format!("^{escaped}$")).ok()?);
        }
        Some(Capability {
            name: name.to_string(),
            patterns,
            regexes,
        })
    }

    /// All argument patterns must match; an arity mismatch never matches.
    pub fn verify(&self, args: &[&str]) -> bool {
        if args.len() != self.regexes.len() {
            return false;
        }
        args.iter()
            .zip(&self.regexes)
            .all(|(arg, regex)| regex.is_match(arg))
    }
}

/// A user's composed rule set, keyed by capability name.
#[derive(Debug, Clone, Default)]
pub struct Authorization {
    caps: HashMap<String, Vec<Capability>>,
}

impl Authorization {
    /// Build from `auth_rules` entries: `CapName(p1,p2)` grants a capability,
    /// `CapName` or `CapName()` grants it with no argument patterns. Unknown
    /// shapes are logged and skipped.
    pub fn from_rules(rules: &[String], user: &str) -> Authorization {
        let mut auth = Authorization::default();
        for rule in rules {
            match parse_rule(rule) {
                Some(cap) => auth.grant(cap),
                None => {
                    tracing::warn!(user, rule, "skipping unparseable authorization rule");
                }
            }
        }
        auth
    }

    pub fn grant(&mut self, cap: Capability) {
        self.caps.entry(cap.name.clone()).or_default().push(cap);
    }

    pub fn has_capability(&self, cap_name: &str) -> bool {
        self.caps.contains_key(cap_name)
    }

    pub fn is_authorized(&self, cap_name: &str, args: &[&str]) -> bool {
        match self.caps.get(cap_name) {
            Some(caps) => caps.iter().any(|cap| cap.verify(args)),
            None => false,
        }
    }
}

fn parse_rule(rule: &str) -> Option<Capability> {
    let rule = rule.trim();
    if !rule.starts_with("Cap") {
        return None;
    }
    match rule.find('(') {
        None => Capability::new(rule, Vec::new()),
        Some(open) => {
            let close = rule.rfind(')')?;
            if close < open {
                return None;
            }
            let name = &rule[..open];
            let inner = rule[open + 1..close].trim();
            let patterns = if inner.is_empty() {
                Vec::new()
            } else {
                inner.split(',').map(|p| p.trim().to_string()).collect()
            };
            Capability::new(name, patterns)
        }
    }
}

/// The server-wide gate. Disabled means every check passes.
#[derive(Debug, Clone, Copy)]
pub struct AccessGate {
    enabled: bool,
}

impl AccessGate {
    pub fn new(enabled: bool) -> Self {
        AccessGate { enabled }
    }

    pub fn has_capability(&self, auth: Option<&Authorization>, cap_name: &str) -> bool {
        if !self.enabled {
            return true;
        }
        auth.map(|a| a.has_capability(cap_name)).unwrap_or(false)
    }

    pub fn is_authorized(
        &self,
        auth: Option<&Authorization>,
        cap_name: &str,
        args: &[&str],
    ) -> bool {
        if !self.enabled {
            return true;
        }
        auth.map(|a| a.is_authorized(cap_name, args)).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_patterns_match_in_full() {
        let cap = Capability::new(CAP_RESOURCE_ADD, vec!["git".into(), "repo*".into(), "*".into()])
            .unwrap();
        assert!(cap.verify(&["git", "repoA", "/a.c"]));
        assert!(!cap.verify(&["svn", "repoA", "/a.c"]));
        // full match: "repo" pattern does not cover "repoA" without the star
        let strict = Capability::new(CAP_RESOURCE_ADD, vec!["git".into(), "repo".into(), "*".into()])
            .unwrap();
        assert!(!strict.verify(&["git", "repoA", "/a.c"]));
    }

    #[test]
    fn arity_mismatch_never_matches() {
        let cap = Capability::new(CAP_BRANCH_CREATE, vec![]).unwrap();
        assert!(cap.verify(&[]));
        assert!(!cap.verify(&["main"]));
    }

    #[test]
    fn rules_parse_with_and_without_patterns() {
        let auth = Authorization::from_rules(
            &[
                "CapBranchCreate()".to_string(),
                "CapResourceAdd(git,*,*)".to_string(),
                "CapBranchList".to_string(),
                "garbage".to_string(),
            ],
            "mark",
        );
        assert!(auth.has_capability(CAP_BRANCH_CREATE));
        assert!(auth.has_capability(CAP_BRANCH_LIST));
        assert!(auth.is_authorized(CAP_RESOURCE_ADD, &["git", "repoA", "/a.c"]));
        assert!(!auth.is_authorized(CAP_RESOURCE_ADD, &["svn", "repoA", "/a.c"]));
        assert!(!auth.has_capability(CAP_LINK_ADD));
    }

    #[test]
    fn disabled_gate_allows_everything() {
        let gate = AccessGate::new(false);
        assert!(gate.has_capability(None, CAP_LINK_REMOVE));
        assert!(gate.is_authorized(None, CAP_LINK_REMOVE, &["anything"]));
    }

    #[test]
    fn enabled_gate_requires_rules() {
        let gate = AccessGate::new(true);
        assert!(!gate.has_capability(None, CAP_LINK_REMOVE));
        let auth = Authorization::from_rules(&["CapLinkRemove(*,*,*,*,*,*)".to_string()], "u");
        assert!(gate.has_capability(Some(&auth), CAP_LINK_REMOVE));
        assert!(gate.is_authorized(
            Some(&auth),
            CAP_LINK_REMOVE,
            &["git", "repoA", "/a.c", "mdl", "modelM", "/m1"]
        ));
    }
}
