use std::time::Duration;

use pfe_ct::{PhyIfId, IDEX_DISCOVERY_CANDIDATES};

use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Answers master discovery and owns the shared resources.
    Master,
    Slave,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdexConfig {
    pub role: Role,
    /// Interface this node's IDEX traffic arrives on. Learned from inbound requests when `None`.
    pub local_phy_if: Option<PhyIfId>,
    /// Known master interface. Discovered at bring-up when `None`.
    pub master_phy_if: Option<PhyIfId>,
    /// Supervisor ticks a sent request may wait for its response. The first tick can land right
    /// after sending, so the guaranteed wait is `request_timeout_ticks - 1` periods.
    pub request_timeout_ticks: u32,
    pub tick_period: Duration,
    pub rpc_attempts: u32,
    pub discovery_rounds: u32,
    pub discovery_period: Duration,
    pub discovery_candidates: Vec<PhyIfId>,
}

impl Default for IdexConfig {
    fn default() -> Self {
        Self {
            role: Role::Slave,
            local_phy_if: None,
            master_phy_if: None,
            request_timeout_ticks: 2,
            tick_period: Duration::from_secs(1),
            rpc_attempts: 3,
            discovery_rounds: 10,
            discovery_period: Duration::from_secs(1),
            discovery_candidates: IDEX_DISCOVERY_CANDIDATES.to_vec(),
        }
    }
}

impl IdexConfig {
    pub fn master() -> Self {
        Self {
            role: Role::Master,
            ..Self::default()
        }
    }

    /// Reduced profile: the master sits on a fixed interface and is never discovered.
    pub fn inline_profile(master_phy_if: PhyIfId) -> Self {
        Self {
            master_phy_if: Some(master_phy_if),
            discovery_rounds: 0,
            discovery_candidates: Vec::new(),
            ..Self::default()
        }
    }

    pub fn is_master(&self) -> bool {
        self.role == Role::Master
    }

    /// Reads `PFE_IDEX_*` overrides on top of [`IdexConfig::default`].
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut cfg = Self::default();

        if let Some(raw) = lookup("PFE_IDEX_ROLE") {
            cfg.role = match raw.trim().to_ascii_lowercase().as_str() {
                "master" => Role::Master,
                "slave" => Role::Slave,
                _ => return Err(ConfigError::InvalidEnv("PFE_IDEX_ROLE")),
            };
        }
        if let Some(raw) = lookup("PFE_IDEX_LOCAL_PHY_IF") {
            cfg.local_phy_if = Some(parse_phy_if(&raw, "PFE_IDEX_LOCAL_PHY_IF")?);
        }
        if let Some(raw) = lookup("PFE_IDEX_MASTER_PHY_IF") {
            cfg.master_phy_if = Some(parse_phy_if(&raw, "PFE_IDEX_MASTER_PHY_IF")?);
        }
        if let Some(raw) = lookup("PFE_IDEX_REQ_TIMEOUT_TICKS") {
            cfg.request_timeout_ticks = parse_nonzero(&raw, "PFE_IDEX_REQ_TIMEOUT_TICKS")?;
        }
        if let Some(raw) = lookup("PFE_IDEX_TICK_MS") {
            cfg.tick_period = Duration::from_millis(parse_nonzero(&raw, "PFE_IDEX_TICK_MS")?.into());
        }
        if let Some(raw) = lookup("PFE_IDEX_RPC_ATTEMPTS") {
            cfg.rpc_attempts = parse_nonzero(&raw, "PFE_IDEX_RPC_ATTEMPTS")?;
        }
        if let Some(raw) = lookup("PFE_IDEX_DISCOVERY_ROUNDS") {
            cfg.discovery_rounds = raw
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidEnv("PFE_IDEX_DISCOVERY_ROUNDS"))?;
        }
        if let Some(raw) = lookup("PFE_IDEX_DISCOVERY_PERIOD_MS") {
            cfg.discovery_period = Duration::from_millis(
                parse_nonzero(&raw, "PFE_IDEX_DISCOVERY_PERIOD_MS")?.into(),
            );
        }
        if let Some(raw) = lookup("PFE_IDEX_DISCOVERY_IFS") {
            let list = raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| parse_phy_if(s, "PFE_IDEX_DISCOVERY_IFS"))
                .collect::<Result<Vec<_>, _>>()?;
            if list.is_empty() {
                return Err(ConfigError::InvalidEnv("PFE_IDEX_DISCOVERY_IFS"));
            }
            cfg.discovery_candidates = list;
        }

        Ok(cfg)
    }
}

/// Accepts a numeric id or an interface name such as `HIF1`.
fn parse_phy_if(raw: &str, var: &'static str) -> Result<PhyIfId, ConfigError> {
    let raw = raw.trim();
    let id = match raw.parse::<u8>() {
        Ok(n) => PhyIfId::from_raw(n),
        Err(_) => (0..PhyIfId::INVALID.raw())
            .map(PhyIfId::from_raw)
            .find(|id| id.name().eq_ignore_ascii_case(raw))
            .ok_or(ConfigError::InvalidEnv(var))?,
    };
    if id.is_valid() {
        Ok(id)
    } else {
        Err(ConfigError::InvalidEnv(var))
    }
}

fn parse_nonzero(raw: &str, var: &'static str) -> Result<u32, ConfigError> {
    match raw.trim().parse::<u32>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(ConfigError::InvalidEnv(var)),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn empty_environment_gives_defaults() {
        assert_eq!(IdexConfig::from_lookup(lookup(&[])).unwrap(), IdexConfig::default());
    }

    #[test]
    fn overrides_are_applied() {
        let cfg = IdexConfig::from_lookup(lookup(&[
            ("PFE_IDEX_ROLE", "Master"),
            ("PFE_IDEX_LOCAL_PHY_IF", "hif1"),
            ("PFE_IDEX_REQ_TIMEOUT_TICKS", "4"),
            ("PFE_IDEX_TICK_MS", "20"),
            ("PFE_IDEX_DISCOVERY_ROUNDS", "0"),
            ("PFE_IDEX_DISCOVERY_IFS", "6, HIF2 ,"),
        ]))
        .unwrap();
        assert_eq!(cfg.role, Role::Master);
        assert_eq!(cfg.local_phy_if, Some(PhyIfId::HIF1));
        assert_eq!(cfg.request_timeout_ticks, 4);
        assert_eq!(cfg.tick_period, Duration::from_millis(20));
        assert_eq!(cfg.discovery_rounds, 0);
        assert_eq!(cfg.discovery_candidates, vec![PhyIfId::HIF0, PhyIfId::HIF2]);
    }

    #[test]
    fn invalid_values_name_the_variable() {
        for (var, value) in [
            ("PFE_IDEX_ROLE", "leader"),
            ("PFE_IDEX_MASTER_PHY_IF", "10"),
            ("PFE_IDEX_MASTER_PHY_IF", "HIF9"),
            ("PFE_IDEX_RPC_ATTEMPTS", "0"),
            ("PFE_IDEX_TICK_MS", "-1"),
            ("PFE_IDEX_DISCOVERY_IFS", " , "),
        ] {
            assert_eq!(
                IdexConfig::from_lookup(lookup(&[(var, value)])),
                Err(ConfigError::InvalidEnv(var)),
                "{var}={value}"
            );
        }
    }

    #[test]
    fn inline_profile_skips_discovery() {
        let cfg = IdexConfig::inline_profile(PhyIfId::HIF0);
        assert_eq!(cfg.master_phy_if, Some(PhyIfId::HIF0));
        assert_eq!(cfg.discovery_rounds, 0);
        assert_eq!(cfg.rpc_attempts, 3);
        assert!(!cfg.is_master());
    }
}
