//! Admission policy: whitelist, blacklist, then an optional scripted rule. Fail-closed.

mod lua_rule;
mod rhai_rule;
pub mod rule;

use std::collections::HashMap;

use regex::bytes::{Regex, RegexBuilder};
use tracing::{debug, info, warn, Span};

pub use lua_rule::LuaRule;
pub use rhai_rule::RhaiRule;
pub use rule::{build_rule, Rule, RuleError, RuleLang, RuleLimits, RuleSource};

/// Deduplicating set of byte-level regular expressions, keyed by pattern text.
/// Patterns compile with Unicode mode off: `\xff` and `.` match single raw bytes.
#[derive(Debug, Default)]
pub struct MatchList {
    patterns: HashMap<String, Regex>,
}

impl MatchList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile and add `pattern`. Adding a pattern twice is a no-op.
    pub fn add(&mut self, pattern: &str) -> Result<(), PolicyError> {
        if self.patterns.contains_key(pattern) {
            return Ok(());
        }
        let re = RegexBuilder::new(pattern)
            .unicode(false)
            .build()
            .map_err(|source| PolicyError::PatternCompile {
                pattern: pattern.to_string(),
                source,
            })?;
        self.patterns.insert(pattern.to_string(), re);
        Ok(())
    }

    /// True if any pattern matches somewhere in `id`.
    pub fn matches(&self, id: &[u8]) -> bool {
        self.patterns.values().any(|re| re.is_match(id))
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn clear(&mut self) {
        self.patterns.clear();
    }
}

/// Static lists plus a rule, as read from configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicySource {
    pub whitelist: Vec<String>,
    pub blacklist: Vec<String>,
    pub rule: Option<RuleSource>,
}

/// Decides whether a content reference should be fetched and stored.
///
/// `pass` takes `&self` and may run from many threads. Swapping the rule takes
/// `&mut self`, so the embedder serializes it (an `RwLock` around the policy is enough).
pub struct AdmissionPolicy {
    whitelist: MatchList,
    blacklist: MatchList,
    rule: Option<Box<dyn Rule>>,
    span: Span,
}

impl AdmissionPolicy {
    /// Empty policy: rejects everything until lists or a rule are configured.
    pub fn new(span: Span) -> Self {
        Self {
            whitelist: MatchList::new(),
            blacklist: MatchList::new(),
            rule: None,
            span,
        }
    }

    /// Build from configuration. Bad patterns and a rule that fails to build are logged
    /// and skipped; the rest of the policy still applies.
    pub fn from_source(source: &PolicySource, limits: &RuleLimits, span: Span) -> Self {
        let mut policy = Self::new(span);
        policy.whitelist(&source.whitelist);
        policy.blacklist(&source.blacklist);
        if let Some(rule) = &source.rule {
            if let Err(e) = policy.load_rule(rule, limits) {
                warn!(parent: &policy.span, error = %e, lang = ?rule.lang, "rule not loaded");
            }
        }
        policy
    }

    /// Add whitelist patterns. Invalid ones are logged and ignored.
    pub fn whitelist<I, S>(&mut self, patterns: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        add_patterns(&mut self.whitelist, patterns, "whitelist", &self.span);
    }

    /// Add blacklist patterns. Invalid ones are logged and ignored.
    pub fn blacklist<I, S>(&mut self, patterns: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        add_patterns(&mut self.blacklist, patterns, "blacklist", &self.span);
    }

    /// Install `rule`, releasing the one it replaces.
    pub fn set_rule(&mut self, rule: Box<dyn Rule>) {
        if let Some(mut old) = self.rule.replace(rule) {
            old.release();
            info!(parent: &self.span, "admission rule replaced");
        } else {
            info!(parent: &self.span, "admission rule installed");
        }
    }

    /// Build a rule from `source` and install it. On failure the current rule stays active.
    pub fn load_rule(&mut self, source: &RuleSource, limits: &RuleLimits) -> Result<(), RuleError> {
        let rule = build_rule(source, limits)?;
        self.set_rule(rule);
        Ok(())
    }

    pub fn has_rule(&self) -> bool {
        self.rule.is_some()
    }

    /// Run the cascade: whitelist accepts, blacklist rejects, then the rule decides.
    /// Without a rule, or when the rule fails, the reference is rejected.
    pub fn pass(&self, id: &[u8], size: u64) -> bool {
        if self.whitelist.matches(id) {
            return true;
        }
        if self.blacklist.matches(id) {
            return false;
        }
        let Some(rule) = &self.rule else {
            debug!(parent: &self.span, "no admission rule configured, rejecting");
            return false;
        };
        match rule.evaluate(id, size) {
            Ok(verdict) => verdict,
            Err(e) => {
                warn!(parent: &self.span, error = %e, size, "admission rule failed, rejecting");
                false
            }
        }
    }

    /// Release the rule and clear both lists.
    pub fn close(&mut self) {
        if let Some(mut rule) = self.rule.take() {
            rule.release();
        }
        self.whitelist.clear();
        self.blacklist.clear();
    }
}

impl Drop for AdmissionPolicy {
    fn drop(&mut self) {
        if let Some(mut rule) = self.rule.take() {
            rule.release();
        }
    }
}

fn add_patterns<I, S>(list: &mut MatchList, patterns: I, name: &str, span: &Span)
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    for pattern in patterns {
        if let Err(e) = list.add(pattern.as_ref()) {
            warn!(parent: span, list = name, error = %e, "ignoring pattern");
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("pattern {pattern:?} does not compile: {source}")]
    PatternCompile {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct FixedRule {
        verdict: bool,
        released: Arc<AtomicUsize>,
    }

    impl FixedRule {
        fn boxed(verdict: bool) -> (Box<dyn Rule>, Arc<AtomicUsize>) {
            let released = Arc::new(AtomicUsize::new(0));
            let rule = FixedRule {
                verdict,
                released: released.clone(),
            };
            (Box::new(rule), released)
        }
    }

    impl Rule for FixedRule {
        fn evaluate(&self, _id: &[u8], _size: u64) -> Result<bool, RuleError> {
            Ok(self.verdict)
        }

        fn release(&mut self) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct FailingRule;

    impl Rule for FailingRule {
        fn evaluate(&self, _id: &[u8], _size: u64) -> Result<bool, RuleError> {
            Err(RuleError::Runtime("boom".into()))
        }

        fn release(&mut self) {}
    }

    fn policy() -> AdmissionPolicy {
        AdmissionPolicy::new(Span::none())
    }

    #[test]
    fn whitelist_wins_over_blacklist() {
        let mut p = policy();
        p.whitelist(["^cat/"]);
        p.blacklist(["^cat/evil"]);
        assert!(p.pass(b"cat/evil-1", 10));
    }

    #[test]
    fn blacklist_alone_rejects() {
        let mut p = policy();
        p.blacklist(["^cat/evil"]);
        let (rule, _) = FixedRule::boxed(true);
        p.set_rule(rule);
        assert!(!p.pass(b"cat/evil-1", 10));
        assert!(p.pass(b"cat/good", 10));
    }

    #[test]
    fn nothing_configured_rejects() {
        let p = policy();
        assert!(!p.pass(b"cat/evil-1", 10));
        assert!(!p.pass(b"", 0));
    }

    #[test]
    fn patterns_match_raw_bytes() {
        let mut p = policy();
        p.whitelist([r"^\x00\xff", r"^raw/.$"]);
        assert!(p.pass(&[0x00, 0xff, 0x10], 0));
        assert!(!p.pass(&[0x00, 0xc3, 0xbf], 0));
        assert!(!p.pass(&[0xff, 0x00], 0));
        assert!(p.pass(b"raw/\x80", 0));
        assert!(!p.pass("raw/\u{e9}".as_bytes(), 0));
    }

    #[test]
    fn invalid_pattern_is_not_fatal() {
        let mut p = policy();
        p.whitelist(["(unclosed", "^ok$"]);
        assert!(p.pass(b"ok", 0));
        assert!(!p.pass(b"(unclosed", 0));

        let mut list = MatchList::new();
        assert!(matches!(
            list.add("[z-a]"),
            Err(PolicyError::PatternCompile { .. })
        ));
        assert!(list.is_empty());
    }

    #[test]
    fn patterns_deduplicate() {
        let mut list = MatchList::new();
        list.add("^a").unwrap();
        list.add("^a").unwrap();
        list.add("^b").unwrap();
        assert_eq!(list.len(), 2);
        assert!(list.matches(b"abc"));
        assert!(list.matches(b"bcd"));
        assert!(!list.matches(b"cde"));
    }

    #[test]
    fn rule_hot_swap_releases_previous_once() {
        let mut p = policy();
        let (a, a_released) = FixedRule::boxed(true);
        let (b, b_released) = FixedRule::boxed(false);
        p.set_rule(a);
        assert!(p.pass(b"x", 1));
        p.set_rule(b);
        assert!(!p.pass(b"x", 1));
        assert_eq!(a_released.load(Ordering::SeqCst), 1);
        assert_eq!(b_released.load(Ordering::SeqCst), 0);
        drop(p);
        assert_eq!(a_released.load(Ordering::SeqCst), 1);
        assert_eq!(b_released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failed_load_keeps_current_rule() {
        let mut p = policy();
        let (a, a_released) = FixedRule::boxed(true);
        p.set_rule(a);
        let bad = RuleSource::new(RuleLang::Lua, "function ploy(id, size");
        assert!(p.load_rule(&bad, &RuleLimits::default()).is_err());
        assert!(p.pass(b"x", 1));
        assert_eq!(a_released.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn rule_failure_rejects() {
        let mut p = policy();
        p.set_rule(Box::new(FailingRule));
        assert!(!p.pass(b"x", 1));

        let wrong_type = RuleSource::new(RuleLang::Rhai, "fn ploy(id, size) { 42 }");
        p.load_rule(&wrong_type, &RuleLimits::default()).unwrap();
        assert!(!p.pass(b"x", 1));
    }

    #[test]
    fn close_releases_rule_and_clears_lists() {
        let mut p = policy();
        p.whitelist(["^cat/"]);
        let (rule, released) = FixedRule::boxed(true);
        p.set_rule(rule);
        p.close();
        assert!(!p.has_rule());
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert!(!p.pass(b"cat/1", 0));
        drop(p);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn from_source_skips_broken_parts() {
        let source = PolicySource {
            whitelist: vec!["^keep/".into(), "(".into()],
            blacklist: vec!["^drop/".into()],
            rule: Some(RuleSource::new(RuleLang::Lua, "not lua at all")),
        };
        let p = AdmissionPolicy::from_source(&source, &RuleLimits::default(), Span::none());
        assert!(!p.has_rule());
        assert!(p.pass(b"keep/1", 0));
        assert!(!p.pass(b"drop/1", 0));
        assert!(!p.pass(b"other", 0));
    }

    #[test]
    fn concurrent_lua_evaluation() {
        let source = PolicySource {
            whitelist: vec![],
            blacklist: vec!["^spam/".into()],
            rule: Some(RuleSource::new(
                RuleLang::Lua,
                "function ploy(id, size) return size <= 1024 end",
            )),
        };
        let p = Arc::new(AdmissionPolicy::from_source(
            &source,
            &RuleLimits::default(),
            Span::none(),
        ));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let p = p.clone();
                std::thread::spawn(move || {
                    for size in 1000..1050u64 {
                        assert_eq!(p.pass(b"doc/1", size), size <= 1024);
                        assert!(!p.pass(b"spam/1", 1));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }
}
