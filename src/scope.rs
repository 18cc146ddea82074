use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use crate::error::ConfigError;

// Rates every deployment starts with; `--scope` may override or extend them
pub const BUILTIN_RATES: &[(&str, &str)] = &[
    ("anon", "100/hour"),
    ("user", "1000/hour"),
    ("login", "5/15min"),
    ("register", "3/hour"),
    ("password_reset", "3/hour"),
    ("api", "10000/day"),
    ("upload", "10/hour"),
    ("export", "5/hour"),
    ("sensitive_throttle", "10/hour"),
    ("bulk_throttle", "100/day"),
];

pub const ANON_SCOPE: &str = "anon";
pub const USER_SCOPE: &str = "user";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rate {
    pub limit: u32,
    pub window: Duration,
}

impl Rate {
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidRate {
            rate: raw.to_string(),
            reason: reason.to_string(),
        };

        let (count, period) = raw
            .trim()
            .split_once('/')
            .ok_or_else(|| invalid("missing `/`"))?;

        let limit: u32 = count
            .trim()
            .parse()
            .map_err(|_| invalid("limit is not a non-negative integer"))?;
        if limit == 0 {
            return Err(invalid("limit must be at least 1"));
        }

        let period = period.trim();
        let digits = period.chars().take_while(|c| c.is_ascii_digit()).count();
        let (multiplier, unit) = period.split_at(digits);
        let multiplier: u64 = if multiplier.is_empty() {
            1
        } else {
            multiplier
                .parse()
                .map_err(|_| invalid("period multiplier is too large"))?
        };
        if multiplier == 0 {
            return Err(invalid("period multiplier must be at least 1"));
        }

        let unit_secs = match unit.trim() {
            "s" | "sec" | "secs" | "second" | "seconds" => 1,
            "m" | "min" | "mins" | "minute" | "minutes" => 60,
            "h" | "hour" | "hours" => 3_600,
            "d" | "day" | "days" => 86_400,
            "" => return Err(invalid("missing period unit")),
            _ => return Err(invalid("unknown period unit")),
        };

        let secs = multiplier
            .checked_mul(unit_secs)
            .ok_or_else(|| invalid("period is too long"))?;

        Ok(Self {
            limit,
            window: Duration::from_secs(secs),
        })
    }
}

impl fmt::Display for Rate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.window.as_secs();
        let (n, unit) = if secs % 86_400 == 0 {
            (secs / 86_400, "day")
        } else if secs % 3_600 == 0 {
            (secs / 3_600, "hour")
        } else if secs % 60 == 0 {
            (secs / 60, "min")
        } else {
            (secs, "sec")
        };
        if n == 1 {
            write!(f, "{}/{}", self.limit, unit)
        } else {
            write!(f, "{}/{}{}", self.limit, n, unit)
        }
    }
}

// named rate policy for a class of endpoints
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThrottleScope {
    pub name: String,
    pub limit: u32,
    pub window: Duration,
}

impl ThrottleScope {
    pub fn new(name: impl Into<String>, rate: Rate) -> Self {
        Self {
            name: name.into(),
            limit: rate.limit,
            window: rate.window,
        }
    }

    pub fn rate(&self) -> Rate {
        Rate {
            limit: self.limit,
            window: self.window,
        }
    }
}

// JSON view for GET /v1/scopes
#[derive(Debug, Serialize)]
pub struct ScopeView {
    pub name: String,
    pub limit: u32,
    pub window_secs: u64,
    pub rate: String,
}

impl From<&ThrottleScope> for ScopeView {
    fn from(scope: &ThrottleScope) -> Self {
        Self {
            name: scope.name.clone(),
            limit: scope.limit,
            window_secs: scope.window.as_secs(),
            rate: scope.rate().to_string(),
        }
    }
}

// scope_name -> ThrottleScope, built once at startup
#[derive(Debug, Clone, Default)]
pub struct ScopeRegistry {
    scopes: BTreeMap<String, ThrottleScope>,
}

impl ScopeRegistry {
    // built-in rates, then overrides on top
    pub fn with_overrides<'a, I>(overrides: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut scopes = BTreeMap::new();
        for (name, rate) in BUILTIN_RATES.iter().copied().chain(overrides) {
            let scope = ThrottleScope::new(name, Rate::parse(rate)?);
            scopes.insert(name.to_string(), scope);
        }
        Ok(Self { scopes })
    }

    pub fn builtin() -> Result<Self, ConfigError> {
        Self::with_overrides(std::iter::empty())
    }

    pub fn from_scopes(scopes: impl IntoIterator<Item = ThrottleScope>) -> Self {
        Self {
            scopes: scopes.into_iter().map(|s| (s.name.clone(), s)).collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ThrottleScope> {
        self.scopes.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.scopes.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ThrottleScope> {
        self.scopes.values()
    }

    pub fn len(&self) -> usize {
        self.scopes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }
}
