//! Ignore / un-ignore rules.
//!
//! A [`RuleSet`] decides, for every `(device type, channel, parameter)`
//! triple, whether the materializer may turn the parameter into an
//! entity. Evaluation is total and deterministic:
//!
//! 1. A matching un-ignore rule always includes the parameter, however
//!    broad it is and however specific a competing ignore rule is.
//! 2. Otherwise a matching ignore rule excludes it. Among rules with the
//!    same action the most specific one is reported (exact beats prefix
//!    beats wildcard, per dimension).
//! 3. With no matching user rule, built-in ignores apply: a fixed list of
//!    service parameters, and anything the backend marks hidden or internal.
//! 4. Otherwise the parameter is included.
//!
//! Rule files are TOML:
//!
//! ```toml
//! [[rule]]
//! action = "ignore"
//! device_type = "HmIP-eTRV*"
//! parameter = "VALVE_ADAPTION"
//!
//! [[rule]]
//! action = "unignore"
//! device_type = "HmIP-eTRV-2"
//! parameter = "VALVE_ADAPTION"
//! channel = 1
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use hmgate_api::Flags;

/// Parameters never materialized unless explicitly un-ignored.
pub const BUILTIN_IGNORED: &[&str] = &[
    "AES_KEY",
    "DEVICE_IN_BOOTLOADER",
    "INSTALL_TEST",
    "STICKY_UNREACH",
];

// ── Pattern ──────────────────────────────────────────────────────────

/// `*` (anything), `PREFIX*`, or an exact value. Matching ignores ASCII case.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Pattern {
    #[default]
    Any,
    Prefix(String),
    Exact(String),
}

impl Pattern {
    pub fn matches(&self, value: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Prefix(prefix) => value
                .get(..prefix.len())
                .is_some_and(|head| head.eq_ignore_ascii_case(prefix)),
            Self::Exact(exact) => value.eq_ignore_ascii_case(exact),
        }
    }

    /// 0 for `*`, 1 for a prefix, 2 for an exact value.
    pub fn specificity(&self) -> u8 {
        match self {
            Self::Any => 0,
            Self::Prefix(_) => 1,
            Self::Exact(_) => 2,
        }
    }

    /// Length of the literal part, to rank prefixes against each other.
    pub fn literal_len(&self) -> usize {
        match self {
            Self::Any => 0,
            Self::Prefix(s) | Self::Exact(s) => s.len(),
        }
    }
}

impl FromStr for Pattern {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        Ok(if s.is_empty() || s == "*" {
            Self::Any
        } else if let Some(prefix) = s.strip_suffix('*') {
            Self::Prefix(prefix.to_owned())
        } else {
            Self::Exact(s.to_owned())
        })
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => f.write_str("*"),
            Self::Prefix(p) => write!(f, "{p}*"),
            Self::Exact(e) => f.write_str(e),
        }
    }
}

impl Serialize for Pattern {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Pattern {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(s.parse().unwrap_or(Self::Any))
    }
}

// ── Rule ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    Ignore,
    Unignore,
}

/// One ignore or un-ignore entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub action: RuleAction,
    #[serde(default)]
    pub device_type: Pattern,
    #[serde(default)]
    pub parameter: Pattern,
    /// `None` matches every channel.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<u32>,
}

impl Rule {
    pub fn ignore(device_type: &str, parameter: &str, channel: Option<u32>) -> Self {
        Self::new(RuleAction::Ignore, device_type, parameter, channel)
    }

    pub fn unignore(device_type: &str, parameter: &str, channel: Option<u32>) -> Self {
        Self::new(RuleAction::Unignore, device_type, parameter, channel)
    }

    fn new(action: RuleAction, device_type: &str, parameter: &str, channel: Option<u32>) -> Self {
        Self {
            action,
            device_type: device_type.parse().unwrap_or_default(),
            parameter: parameter.parse().unwrap_or_default(),
            channel,
        }
    }

    fn matches(&self, device_type: &str, channel: Option<u32>, parameter: &str) -> bool {
        self.device_type.matches(device_type)
            && self.parameter.matches(parameter)
            && self.channel.is_none_or(|c| Some(c) == channel)
    }

    /// Higher is more specific. Exact dimensions dominate; prefix length
    /// breaks ties between prefixes.
    fn rank(&self) -> (u8, usize) {
        let dims = self.device_type.specificity()
            + self.parameter.specificity()
            + if self.channel.is_some() { 2 } else { 0 };
        (dims, self.device_type.literal_len() + self.parameter.literal_len())
    }
}

// ── Decision ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Include,
    Exclude,
}

impl Decision {
    pub fn is_included(self) -> bool {
        self == Self::Include
    }
}

// ── RuleSet ──────────────────────────────────────────────────────────

/// Ordered user rules plus the built-in defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSet {
    #[serde(default, rename = "rule")]
    rules: Vec<Rule>,
}

impl RuleSet {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self { rules }
    }

    pub fn push(&mut self, rule: Rule) {
        self.rules.push(rule);
    }

    /// Append the rules of another set (e.g. a second rule file).
    pub fn extend(&mut self, other: RuleSet) {
        self.rules.extend(other.rules);
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// The matching user rule that decides the triple, if any.
    fn winning_rule(
        &self,
        device_type: &str,
        channel: Option<u32>,
        parameter: &str,
    ) -> Option<&Rule> {
        self.rules
            .iter()
            .filter(|r| r.matches(device_type, channel, parameter))
            .max_by(|a, b| {
                let weight = |r: &Rule| u8::from(r.action == RuleAction::Unignore);
                weight(a)
                    .cmp(&weight(b))
                    .then_with(|| a.rank().cmp(&b.rank()))
            })
    }

    /// Decide a parameter of the VALUES paramset.
    pub fn decide(
        &self,
        device_type: &str,
        channel: Option<u32>,
        parameter: &str,
        flags: Flags,
    ) -> Decision {
        if let Some(rule) = self.winning_rule(device_type, channel, parameter) {
            return match rule.action {
                RuleAction::Ignore => Decision::Exclude,
                RuleAction::Unignore => Decision::Include,
            };
        }
        if BUILTIN_IGNORED.contains(&parameter) || !flags.is_visible() || flags.is_internal() {
            return Decision::Exclude;
        }
        Decision::Include
    }

    /// Decide a parameter a schema asks for explicitly. Only a user ignore
    /// rule can exclude it.
    pub fn decide_forced(
        &self,
        device_type: &str,
        channel: Option<u32>,
        parameter: &str,
    ) -> Decision {
        match self.winning_rule(device_type, channel, parameter) {
            Some(rule) if rule.action == RuleAction::Ignore => Decision::Exclude,
            _ => Decision::Include,
        }
    }
}
