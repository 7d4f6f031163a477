//! `--scales` / `--valves` selection syntax: `all` or a comma-separated list.

use std::str::FromStr;

use crate::ids::ScaleKey;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ScaleSelection {
    #[default]
    All,
    Only(Vec<ScaleKey>),
}

impl FromStr for ScaleSelection {
    type Err = eyre::Report;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let t = s.trim();
        if t.eq_ignore_ascii_case("all") {
            return Ok(Self::All);
        }
        let mut keys = Vec::new();
        for part in t.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let key: ScaleKey = part.parse()?;
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
        if keys.is_empty() {
            eyre::bail!("empty scale selection (use `all` or e.g. 0x70-0,0x70-1)");
        }
        Ok(Self::Only(keys))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ValveSelection {
    #[default]
    All,
    Only(Vec<String>),
}

impl ValveSelection {
    pub fn includes(&self, valve: &str) -> bool {
        match self {
            Self::All => true,
            Self::Only(names) => names.iter().any(|n| n == valve),
        }
    }
}

impl FromStr for ValveSelection {
    type Err = eyre::Report;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let t = s.trim();
        if t.eq_ignore_ascii_case("all") {
            return Ok(Self::All);
        }
        let names: Vec<String> = t
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect();
        if names.is_empty() {
            eyre::bail!("empty valve selection (use `all` or e.g. v1,v2)");
        }
        Ok(Self::Only(names))
    }
}
