//! Immutable per-symbol configuration, loaded once from a TOML file at
//! process start (§4.6). There is no reload: a fresh process is required to
//! pick up edits.

use std::collections::HashMap;
use std::path::Path;

use rust_decimal::Decimal;
use serde::Deserialize;

use crate::error::ConfigError;

pub const DEFAULT_CONFIG_PATH: &str = "config.toml";
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8080";
pub const DEFAULT_BACKLOG_CAPACITY: usize = 500;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MarginMode {
    Isolation,
    Cross,
}

impl MarginMode {
    pub fn wire(&self) -> &'static str {
        match self {
            MarginMode::Isolation => "ISOLATION",
            MarginMode::Cross => "CROSS",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderSizeType {
    MarginUsdt,
    NotionalUsdt,
    PctBalance,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SameSidePolicy {
    Ignore,
    ResetOrders,
}

#[derive(Clone, Debug, Deserialize)]
pub struct TpLevel {
    pub level: u32,
    pub target_pct: Decimal,
    pub close_frac: Decimal,
    #[serde(default = "default_true")]
    pub is_enabled: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Clone, Debug, Deserialize)]
pub struct PairConfig {
    pub is_enabled: bool,
    pub margin_mode: MarginMode,
    pub leverage: u32,
    pub margin_coin: String,

    pub order_size_type: OrderSizeType,
    pub order_size_value: Decimal,

    pub sl_enabled: bool,
    #[serde(default)]
    pub sl_pct: Decimal,

    pub tp_enabled: bool,
    #[serde(default, rename = "tp_level")]
    pub tp_levels: Vec<TpLevel>,

    #[serde(default)]
    pub breakeven_enabled: bool,
    #[serde(default)]
    pub breakeven_trigger_pct: Decimal,
    #[serde(default)]
    pub breakeven_offset_pct: Decimal,

    #[serde(default)]
    pub trailing_enabled: bool,
    #[serde(default)]
    pub trailing_trigger_pct: Decimal,
    #[serde(default)]
    pub trailing_step_pct: Decimal,
    #[serde(default)]
    pub trailing_distance_pct: Decimal,
    #[serde(default)]
    pub trailing_move_immediately: bool,

    pub same_side_policy: SameSidePolicy,
}

impl PairConfig {
    /// Only the enabled levels are materialized, ordered ascending by level,
    /// matching the "ordered sequence of enabled levels" data-model contract.
    pub fn enabled_tp_levels(&self) -> Vec<&TpLevel> {
        let mut levels: Vec<&TpLevel> = self.tp_levels.iter().filter(|l| l.is_enabled).collect();
        levels.sort_by_key(|l| l.level);
        levels
    }

    pub fn margin_mode_wire(&self) -> &'static str {
        self.margin_mode.wire()
    }
}

#[derive(Deserialize)]
struct RawFile {
    #[serde(default, rename = "pair")]
    pairs: Vec<RawPair>,
}

#[derive(Deserialize)]
struct RawPair {
    symbol: String,
    #[serde(flatten)]
    config: PairConfig,
}

/// Load and validate the configuration file at `path`, returning a
/// symbol → [`PairConfig`] mapping. Any validation failure is a single fatal
/// error — there is no partial/best-effort load.
pub fn load_config(path: &Path) -> Result<HashMap<String, PairConfig>, ConfigError> {
    let text = std::fs::read_to_string(path)?;
    let raw: RawFile = toml::from_str(&text)?;

    let mut map = HashMap::new();
    for pair in raw.pairs {
        validate_pair_config(&pair.symbol, &pair.config)?;
        map.insert(pair.symbol.to_uppercase(), pair.config);
    }
    Ok(map)
}

fn validate_pair_config(symbol: &str, cfg: &PairConfig) -> Result<(), ConfigError> {
    let pct_field = |name: &str, v: Decimal| -> Result<(), ConfigError> {
        if v < Decimal::ZERO || v > Decimal::ONE {
            return Err(ConfigError::Invalid(format!(
                "{}: {} = {} is out of range [0,1]",
                symbol, name, v
            )));
        }
        Ok(())
    };

    if cfg.leverage < 1 {
        return Err(ConfigError::Invalid(format!("{}: leverage must be >= 1", symbol)));
    }
    pct_field("sl_pct", cfg.sl_pct)?;
    pct_field("breakeven_trigger_pct", cfg.breakeven_trigger_pct)?;
    pct_field("breakeven_offset_pct", cfg.breakeven_offset_pct)?;
    pct_field("trailing_trigger_pct", cfg.trailing_trigger_pct)?;
    pct_field("trailing_step_pct", cfg.trailing_step_pct)?;
    pct_field("trailing_distance_pct", cfg.trailing_distance_pct)?;

    if cfg.order_size_value <= Decimal::ZERO {
        return Err(ConfigError::Invalid(format!(
            "{}: order_size_value must be > 0",
            symbol
        )));
    }

    let mut seen_levels = std::collections::HashSet::new();
    for level in &cfg.tp_levels {
        if !seen_levels.insert(level.level) {
            return Err(ConfigError::Invalid(format!(
                "{}: duplicate tp level {}",
                symbol, level.level
            )));
        }
        if level.target_pct <= Decimal::ZERO || level.target_pct > Decimal::ONE {
            return Err(ConfigError::Invalid(format!(
                "{}: tp level {} target_pct out of range (0,1]",
                symbol, level.level
            )));
        }
        if level.close_frac <= Decimal::ZERO || level.close_frac > Decimal::ONE {
            return Err(ConfigError::Invalid(format!(
                "{}: tp level {} close_frac out of range (0,1]",
                symbol, level.level
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_temp(contents: &str) -> tempfile_path::TempFile {
        tempfile_path::TempFile::new(contents)
    }

    mod tempfile_path {
        use std::io::Write;
        use std::path::PathBuf;

        pub struct TempFile {
            path: PathBuf,
        }

        impl TempFile {
            pub fn new(contents: &str) -> Self {
                let mut path = std::env::temp_dir();
                path.push(format!("bitunix_trader_test_{}.toml", std::process::id()));
                let mut f = std::fs::File::create(&path).unwrap();
                f.write_all(contents.as_bytes()).unwrap();
                TempFile { path }
            }

            pub fn path(&self) -> &std::path::Path {
                &self.path
            }
        }

        impl Drop for TempFile {
            fn drop(&mut self) {
                let _ = std::fs::remove_file(&self.path);
            }
        }
    }

    const VALID_TOML: &str = r#"
[[pair]]
symbol = "BTCUSDT"
is_enabled = true
margin_mode = "ISOLATION"
leverage = 10
margin_coin = "USDT"
order_size_type = "MARGIN_USDT"
order_size_value = "5"
sl_enabled = true
sl_pct = "0.01"
tp_enabled = true
same_side_policy = "IGNORE"

[[pair.tp_level]]
level = 1
target_pct = "0.01"
close_frac = "0.3"

[[pair.tp_level]]
level = 2
target_pct = "0.02"
close_frac = "0.3"
"#;

    #[test]
    fn loads_valid_config() {
        let f = write_temp(VALID_TOML);
        let map = load_config(f.path()).expect("should load");
        let cfg = map.get("BTCUSDT").expect("symbol present");
        assert_eq!(cfg.leverage, 10);
        assert_eq!(cfg.enabled_tp_levels().len(), 2);
    }

    #[test]
    fn rejects_out_of_range_pct() {
        let bad = VALID_TOML.replace(r#"sl_pct = "0.01""#, r#"sl_pct = "1.5""#);
        let f = write_temp(&bad);
        assert!(load_config(f.path()).is_err());
    }

    #[test]
    fn rejects_zero_leverage() {
        let bad = VALID_TOML.replace("leverage = 10", "leverage = 0");
        let f = write_temp(&bad);
        assert!(load_config(f.path()).is_err());
    }

    #[test]
    fn rejects_duplicate_tp_level() {
        let bad = VALID_TOML.replace("level = 2", "level = 1");
        let f = write_temp(&bad);
        assert!(load_config(f.path()).is_err());
    }
}
