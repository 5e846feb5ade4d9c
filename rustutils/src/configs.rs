/// Read summarizer configuration from a json file.
///
/// File format:
///
/// An object { ... } with the following named fields and value types, all optional:
///
///   datasource - string, the tag recorded in the `summarization` block [default "pcp"]
///   fail_fast - bool, re-raise unexpected per-archive errors instead of recording them
///   correct_counter_resets - bool, correct decreases in counter metrics as device resets
///      [default true]
///   good_enough_fraction - number in (0,1], the fraction of nodes that must be processed for
///      a job to count as good enough [default 0.95]
///   normalization - object, metric name -> { "range": bits }, for counters that are known to
///      wrap at 2^bits rather than reset to zero
///
/// Any field name starting with '#' is reserved for arbitrary comments.
///
/// Example:
///
///   {
///     "datasource": "pcp",
///     "normalization": {
///       "perfevent.hwcounters.CPU_CLK_UNHALTED.value": { "range": 48 }
///     }
///   }
use anyhow::{bail, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path;

pub const DEFAULT_DATASOURCE: &str = "pcp";
pub const DEFAULT_GOOD_ENOUGH_FRACTION: f64 = 0.95;

// Wrap widths beyond this are not counters anyone has built.
const MAX_RANGE_BITS: u64 = 64;

// See above comment block for field documentation.

#[derive(Debug, Clone)]
pub struct SummarizeConfig {
    pub datasource: String,
    pub fail_fast: bool,
    pub correct_counter_resets: bool,
    pub good_enough_fraction: f64,
    normalization: HashMap<String, u32>,
}

impl Default for SummarizeConfig {
    fn default() -> SummarizeConfig {
        SummarizeConfig {
            datasource: DEFAULT_DATASOURCE.to_string(),
            fail_fast: false,
            correct_counter_resets: true,
            good_enough_fraction: DEFAULT_GOOD_ENOUGH_FRACTION,
            normalization: HashMap::new(),
        }
    }
}

impl SummarizeConfig {
    /// The wrap width in bits for the metric, if it is a known wrapping counter.

    pub fn wrap_bits(&self, metric_name: &str) -> Option<u32> {
        self.normalization.get(metric_name).copied()
    }

    pub fn set_wrap_bits(&mut self, metric_name: &str, bits: u32) {
        self.normalization.insert(metric_name.to_string(), bits);
    }
}

/// As with the cluster configs, the input is human-generated and mostly optional, so it's decoded
/// from the generic JSON value with explicit field checks rather than a derived parser.

pub fn read_summarize_config(filename: &str) -> Result<SummarizeConfig> {
    let file = File::open(path::Path::new(filename))?;
    let reader = BufReader::new(file);
    let v = serde_json::from_reader(reader)?;
    parse_summarize_config(&v)
}

pub fn parse_summarize_config(v: &Value) -> Result<SummarizeConfig> {
    let mut cfg: SummarizeConfig = Default::default();
    let fields = if let Value::Object(fields) = v {
        fields
    } else {
        bail!("Expected an object value")
    };
    for name in fields.keys() {
        match name.as_str() {
            "datasource" | "fail_fast" | "correct_counter_resets" | "good_enough_fraction"
            | "normalization" => {}
            _ if name.starts_with('#') => {}
            _ => bail!("Unknown field '{name}'"),
        }
    }
    if let Some(s) = grab_string_opt(fields, "datasource")? {
        cfg.datasource = s;
    }
    cfg.fail_fast = grab_bool_opt(fields, "fail_fast")?.unwrap_or(false);
    cfg.correct_counter_resets = grab_bool_opt(fields, "correct_counter_resets")?.unwrap_or(true);
    if let Some(f) = grab_f64_opt(fields, "good_enough_fraction")? {
        if !(f > 0.0 && f <= 1.0) {
            bail!("Field 'good_enough_fraction' must be in the range (0,1]")
        }
        cfg.good_enough_fraction = f;
    }
    if let Some(d) = fields.get("normalization") {
        if let Value::Object(metrics) = d {
            for (metric, params) in metrics {
                if metric.starts_with('#') {
                    continue;
                }
                if let Value::Object(params) = params {
                    let bits = grab_u64(params, "range")?;
                    if bits == 0 || bits > MAX_RANGE_BITS {
                        bail!("Range for '{metric}' must be between 1 and {MAX_RANGE_BITS} bits")
                    }
                    cfg.normalization.insert(metric.to_string(), bits as u32);
                } else {
                    bail!("Normalization for '{metric}' must be an object");
                }
            }
        } else {
            bail!("Field 'normalization' must have an object value");
        }
    }
    Ok(cfg)
}

fn grab_string_opt(fields: &serde_json::Map<String, Value>, name: &str) -> Result<Option<String>> {
    if let Some(val) = fields.get(name) {
        if let Value::String(s) = val {
            Ok(Some(s.to_string()))
        } else {
            bail!("Field '{name}' must have a string value");
        }
    } else {
        Ok(None)
    }
}

fn grab_u64(fields: &serde_json::Map<String, Value>, name: &str) -> Result<u64> {
    if let Some(Value::Number(n)) = fields.get(name) {
        if let Some(n) = n.as_u64() {
            Ok(n)
        } else {
            bail!("Field '{name}' must have unsigned integer value")
        }
    } else {
        bail!("Field '{name}' must be present and have an integer value")
    }
}

fn grab_f64_opt(fields: &serde_json::Map<String, Value>, name: &str) -> Result<Option<f64>> {
    if let Some(d) = fields.get(name) {
        if let Some(f) = d.as_f64() {
            Ok(Some(f))
        } else {
            bail!("Field '{name}' must have a numeric value");
        }
    } else {
        Ok(None)
    }
}

fn grab_bool_opt(fields: &serde_json::Map<String, Value>, name: &str) -> Result<Option<bool>> {
    if let Some(d) = fields.get(name) {
        if let Value::Bool(b) = d {
            Ok(Some(*b))
        } else {
            bail!("Field '{name}' must have a boolean value");
        }
    } else {
        Ok(None)
    }
}

// Basic whitebox test that reading a config file works.

#[test]
fn test_config() {
    let conf = read_summarize_config("../tests/whitebox-config.json").unwrap();
    assert!(conf.datasource == "pcp");
    assert!(conf.fail_fast == false);
    assert!(conf.correct_counter_resets == true);
    assert!(conf.good_enough_fraction == 0.95);
    assert!(conf.wrap_bits("perfevent.hwcounters.CPU_CLK_UNHALTED.value") == Some(48));
    assert!(conf.wrap_bits("network.interface.in.bytes").is_none());
}

#[test]
fn test_config_errors() {
    let bad = |s: &str| parse_summarize_config(&serde_json::from_str(s).unwrap()).is_err();
    assert!(bad("[]"));
    assert!(bad(r#"{"datasource": 7}"#));
    assert!(bad(r#"{"bogus": true}"#));
    assert!(bad(r#"{"good_enough_fraction": 0}"#));
    assert!(bad(r#"{"good_enough_fraction": 1.5}"#));
    assert!(bad(r#"{"normalization": {"x": {"range": 0}}}"#));
    assert!(bad(r#"{"normalization": {"x": {"range": 65}}}"#));
    assert!(bad(r#"{"normalization": {"x": 12}}"#));

    let ok = parse_summarize_config(
        &serde_json::from_str(r##"{"#note": "hi", "datasource": "test", "fail_fast": true}"##)
            .unwrap(),
    )
    .unwrap();
    assert!(ok.datasource == "test");
    assert!(ok.fail_fast);
}
