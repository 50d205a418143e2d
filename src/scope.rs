//! Scope and exclusion filtering.
//!
//! Patterns are regular expressions matched case-insensitively against the
//! full request URL. Lists are ordered and the first matching pattern wins.
use std::sync::Arc;

use parking_lot::RwLock;
use regex::{RegexSet, RegexSetBuilder};

use crate::errors::Result;

/// An ordered list of case-insensitive URL patterns.
#[derive(Debug, Clone)]
pub struct PatternList {
  patterns: Vec<String>,
  set: RegexSet,
}

impl Default for PatternList {
  fn default() -> Self {
    PatternList {
      patterns: Vec::new(),
      set: RegexSet::empty(),
    }
  }
}

impl PatternList {
  /// Compile the patterns. Fails on the first invalid one.
  pub fn new<I, S>(patterns: I) -> Result<Self>
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    let patterns: Vec<String> = patterns.into_iter().map(Into::into).collect();
    let set = RegexSetBuilder::new(&patterns)
      .case_insensitive(true)
      .build()?;
    Ok(PatternList { patterns, set })
  }
  /// Index of the first pattern matching `url`.
  pub fn first_match(&self, url: &str) -> Option<usize> {
    self.set.matches(url).iter().next()
  }
  /// The pattern at `index`.
  pub fn pattern(&self, index: usize) -> Option<&str> {
    self.patterns.get(index).map(String::as_str)
  }
  /// All patterns in order.
  pub fn patterns(&self) -> &[String] {
    &self.patterns
  }
  /// Whether the list has no patterns.
  pub fn is_empty(&self) -> bool {
    self.patterns.is_empty()
  }
  /// A new list with `pattern` appended.
  pub fn with(&self, pattern: &str) -> Result<Self> {
    let mut patterns = self.patterns.clone();
    patterns.push(pattern.to_string());
    PatternList::new(patterns)
  }
}

/// Include and exclude lists evaluated together.
#[derive(Debug, Clone, Default)]
pub struct ScopeRules {
  include: PatternList,
  exclude: PatternList,
}

impl ScopeRules {
  /// Build rules from raw pattern strings.
  pub fn new(include: &[String], exclude: &[String]) -> Result<Self> {
    Ok(ScopeRules {
      include: PatternList::new(include.iter().cloned())?,
      exclude: PatternList::new(exclude.iter().cloned())?,
    })
  }
  /// The exclusion pattern that matches `url`, if any.
  pub fn excluded_by(&self, url: &str) -> Option<&str> {
    self
      .exclude
      .first_match(url)
      .and_then(|i| self.exclude.pattern(i))
  }
  /// Whether `url` is excluded.
  pub fn is_excluded(&self, url: &str) -> bool {
    self.exclude.first_match(url).is_some()
  }
  /// Not excluded, and either no include patterns exist or one matches.
  pub fn is_in_scope(&self, url: &str) -> bool {
    !self.is_excluded(url) && (self.include.is_empty() || self.include.first_match(url).is_some())
  }
  /// Include patterns.
  pub fn include(&self) -> &PatternList {
    &self.include
  }
  /// Exclude patterns.
  pub fn exclude(&self) -> &PatternList {
    &self.exclude
  }
}

/// Shared, runtime-editable scope. Readers get a snapshot and never block
/// each other; edits swap in a new set of rules.
#[derive(Debug, Default)]
pub struct Scope {
  rules: RwLock<Arc<ScopeRules>>,
}

impl Scope {
  /// A scope starting from `rules`.
  pub fn new(rules: ScopeRules) -> Self {
    Scope {
      rules: RwLock::new(Arc::new(rules)),
    }
  }
  /// Current rules.
  pub fn snapshot(&self) -> Arc<ScopeRules> {
    self.rules.read().clone()
  }
  /// See [`ScopeRules::is_in_scope`].
  pub fn is_in_scope(&self, url: &str) -> bool {
    self.snapshot().is_in_scope(url)
  }
  /// See [`ScopeRules::is_excluded`].
  pub fn is_excluded(&self, url: &str) -> bool {
    self.snapshot().is_excluded(url)
  }
  /// Append an exclusion pattern. The list is unchanged when it does not compile.
  pub fn exclude(&self, pattern: &str) -> Result<()> {
    let mut rules = self.rules.write();
    let exclude = rules.exclude.with(pattern)?;
    *rules = Arc::new(ScopeRules {
      include: rules.include.clone(),
      exclude,
    });
    Ok(())
  }
  /// Append an include pattern.
  pub fn include(&self, pattern: &str) -> Result<()> {
    let mut rules = self.rules.write();
    let include = rules.include.with(pattern)?;
    *rules = Arc::new(ScopeRules {
      include,
      exclude: rules.exclude.clone(),
    });
    Ok(())
  }
  /// Drop every exclusion pattern.
  pub fn clear_exclusions(&self) {
    let mut rules = self.rules.write();
    *rules = Arc::new(ScopeRules {
      include: rules.include.clone(),
      exclude: PatternList::default(),
    });
  }
}
