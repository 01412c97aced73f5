use chrono::{NaiveTime, Timelike};
use config::{Config, Environment, File, FileFormat};
use serde::de::{self, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::StationError;
use crate::types::StepType;

/// Wall-clock time of day in UTC, written as "HH:MM" in the configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DailyTime(NaiveTime);

impl DailyTime {
    pub fn from_hm(hour: u32, minute: u32) -> Option<Self> {
        NaiveTime::from_hms_opt(hour, minute, 0).map(DailyTime)
    }

    pub fn time(&self) -> NaiveTime {
        self.0
    }

    /// True if `now` falls inside `[start, stop]`. A window whose start is later
    /// than its stop wraps past midnight.
    pub fn window_contains(start: DailyTime, stop: DailyTime, now: NaiveTime) -> bool {
        // Only minute resolution is configured, compare on the same footing
        let now = NaiveTime::from_hms_opt(now.hour(), now.minute(), 0).unwrap_or(now);
        if start <= stop {
            start.0 <= now && now <= stop.0
        } else {
            now >= start.0 || now <= stop.0
        }
    }
}

impl fmt::Display for DailyTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%H:%M"))
    }
}

impl Serialize for DailyTime {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for DailyTime {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        NaiveTime::parse_from_str(text.trim(), "%H:%M")
            .map(DailyTime)
            .map_err(|e| de::Error::custom(format!("invalid time '{text}', expected HH:MM ({e})")))
    }
}

/// Highest polynomial order accepted for background, offset and shift terms
pub const MAX_TERM_ORDER: u32 = 10;

/// Role of a fit parameter in the forward model
#[derive(Debug, Clone, PartialEq)]
pub enum FitTerm {
    /// Absorber scaled against a reference cross-section read from `xpath`
    Absorber { xpath: PathBuf },
    /// `bg_polyN`: coefficient of the optical-density background polynomial
    Background { order: u32 },
    /// `offsetN`: coefficient of the additive intensity offset polynomial
    Offset { order: u32 },
    /// `shiftN`: coefficient of the wavelength shift polynomial
    Shift { order: u32 },
}

impl FitTerm {
    fn classify(name: &str, xpath: Option<PathBuf>) -> Result<Self, String> {
        let structural = if let Some(order) = parse_order(name, "bg_poly") {
            Some(FitTerm::Background { order })
        } else if let Some(order) = parse_order(name, "offset") {
            Some(FitTerm::Offset { order })
        } else {
            parse_order(name, "shift").map(|order| FitTerm::Shift { order })
        };

        match (structural, xpath) {
            (Some(_), Some(_)) => Err(format!(
                "structural parameter '{name}' cannot have a reference path"
            )),
            (Some(term), None) => match term.order() {
                Some(order) if order > MAX_TERM_ORDER => Err(format!(
                    "order {order} of '{name}' exceeds the maximum of {MAX_TERM_ORDER}"
                )),
                _ => Ok(term),
            },
            (None, Some(xpath)) => Ok(FitTerm::Absorber { xpath }),
            (None, None) => Err(format!(
                "parameter '{name}' is neither bg_polyN, offsetN nor shiftN and has no xpath"
            )),
        }
    }

    pub fn is_absorber(&self) -> bool {
        matches!(self, FitTerm::Absorber { .. })
    }

    /// Polynomial order of a structural term
    pub fn order(&self) -> Option<u32> {
        match self {
            FitTerm::Absorber { .. } => None,
            FitTerm::Background { order } | FitTerm::Offset { order } | FitTerm::Shift { order } => {
                Some(*order)
            }
        }
    }
}

fn parse_order(name: &str, prefix: &str) -> Option<u32> {
    name.strip_prefix(prefix)
        .filter(|suffix| !suffix.is_empty() && suffix.bytes().all(|b| b.is_ascii_digit()))
        .and_then(|suffix| suffix.parse().ok())
}

/// One row of the fit parameter table
#[derive(Debug, Clone, PartialEq)]
pub struct FitParameterSpec {
    pub name: String,
    /// Initial value, used verbatim as the solver's starting point
    pub value: f64,
    /// Fixed parameters keep `value` and are left out of the solver vector
    pub vary: bool,
    pub lo_bound: Option<f64>,
    pub hi_bound: Option<f64>,
    pub term: FitTerm,
}

#[derive(Serialize, Deserialize)]
struct FitParameterEntry {
    value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    xpath: Option<PathBuf>,
    #[serde(default = "default_vary", skip_serializing_if = "is_true")]
    vary: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    lo_bound: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    hi_bound: Option<f64>,
}

fn default_vary() -> bool {
    true
}

fn is_true(value: &bool) -> bool {
    *value
}

/// Ordered fit parameter table. Table order is the layout of the parameter
/// vector for the whole session.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FitParameterTable(Vec<FitParameterSpec>);

impl FitParameterTable {
    pub fn new(params: Vec<FitParameterSpec>) -> Self {
        Self(params)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, FitParameterSpec> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&FitParameterSpec> {
        self.0.iter().find(|p| p.name.eq_ignore_ascii_case(name))
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.0.iter().position(|p| p.name.eq_ignore_ascii_case(name))
    }

    pub fn absorbers(&self) -> impl Iterator<Item = &FitParameterSpec> {
        self.0.iter().filter(|p| p.term.is_absorber())
    }

    fn validate(&self) -> Result<(), StationError> {
        if self.0.is_empty() {
            return Err(StationError::Configuration(
                "fit_parameters must contain at least one parameter".to_string(),
            ));
        }
        if !self.0.iter().any(|p| p.vary) {
            return Err(StationError::Configuration(
                "fit_parameters must contain at least one varying parameter".to_string(),
            ));
        }

        for p in &self.0 {
            if !p.value.is_finite() {
                return Err(StationError::Configuration(format!(
                    "fit parameter '{}' has a non-finite value",
                    p.name
                )));
            }
            if let (Some(lo), Some(hi)) = (p.lo_bound, p.hi_bound) {
                if lo >= hi {
                    return Err(StationError::Configuration(format!(
                        "fit parameter '{}': lo_bound ({lo}) must be less than hi_bound ({hi})",
                        p.name
                    )));
                }
            }
            let below = p.lo_bound.is_some_and(|lo| p.value < lo);
            let above = p.hi_bound.is_some_and(|hi| p.value > hi);
            if below || above {
                return Err(StationError::Configuration(format!(
                    "fit parameter '{}': initial value {} is outside its bounds",
                    p.name, p.value
                )));
            }
        }
        Ok(())
    }
}

impl<'a> IntoIterator for &'a FitParameterTable {
    type Item = &'a FitParameterSpec;
    type IntoIter = std::slice::Iter<'a, FitParameterSpec>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl Serialize for FitParameterTable {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for p in &self.0 {
            let xpath = match &p.term {
                FitTerm::Absorber { xpath } => Some(xpath.clone()),
                _ => None,
            };
            map.serialize_entry(
                &p.name,
                &FitParameterEntry {
                    value: p.value,
                    xpath,
                    vary: p.vary,
                    lo_bound: p.lo_bound,
                    hi_bound: p.hi_bound,
                },
            )?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for FitParameterTable {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct TableVisitor;

        impl<'de> Visitor<'de> for TableVisitor {
            type Value = FitParameterTable;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a table of fit parameters")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut params = Vec::new();
                while let Some((name, entry)) = access.next_entry::<String, FitParameterEntry>()? {
                    let term = FitTerm::classify(&name, entry.xpath).map_err(de::Error::custom)?;
                    params.push(FitParameterSpec {
                        name,
                        value: entry.value,
                        vary: entry.vary,
                        lo_bound: entry.lo_bound,
                        hi_bound: entry.hi_bound,
                        term,
                    });
                }
                Ok(FitParameterTable(params))
            }
        }

        deserializer.deserialize_map(TableVisitor)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ConsoleConfig {
    pub verbosity: String,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            verbosity: "info".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct ExposureControlConfig {
    /// Relative intensity error tolerated before the exposure is corrected
    pub tolerance: f64,
    /// Single-exposure detector counts treated as saturated
    pub saturation_level: f64,
    /// Upper limit for coadds when the integration time is at its maximum
    pub max_coadds: u32,
}

impl Default for ExposureControlConfig {
    fn default() -> Self {
        Self {
            tolerance: 0.1,
            saturation_level: 65535.0,
            max_coadds: 10,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct FitControlConfig {
    /// Retrieval window in nm
    pub fit_window: [f64; 2],
    pub max_iterations: u32,
    /// Relative sum-of-squares improvement below which the fit has converged
    pub tolerance: f64,
    /// Concurrent fits allowed alongside acquisition
    pub fit_threads: usize,
}

impl Default for FitControlConfig {
    fn default() -> Self {
        Self {
            fit_window: [310.0, 320.0],
            max_iterations: 100,
            tolerance: 1e-8,
            fit_threads: 2,
        }
    }
}

fn default_status_dir() -> PathBuf {
    PathBuf::from("Station")
}

/// Station operating envelope. Loaded once, never mutated afterwards.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct StationConfig {
    pub station_name: String,
    pub start_time: DailyTime,
    pub stop_time: DailyTime,
    pub start_int_time: u32,
    pub start_coadds: u32,
    pub min_int_time: u32,
    pub max_int_time: u32,
    pub int_time_step: u32,
    pub target_int: u32,
    pub home_angle: f64,
    pub steps_to_start: u32,
    pub switch_pin: u8,
    pub max_steps_home: u32,
    pub step_type: StepType,
    pub angle_per_step: f64,
    pub steps_per_spec: u32,
    pub specs_per_scan: u32,
    #[serde(default = "default_status_dir")]
    pub status_dir: PathBuf,
    pub fit_parameters: FitParameterTable,
    #[serde(default)]
    pub console: ConsoleConfig,
    #[serde(default)]
    pub exposure_control: ExposureControlConfig,
    #[serde(default)]
    pub fit_control: FitControlConfig,
}

impl StationConfig {
    /// Validate every field against its documented bounds
    pub fn validate(&self) -> Result<(), StationError> {
        let fail = |msg: String| Err(StationError::Configuration(msg));

        if self.station_name.trim().is_empty() {
            return fail("station_name must not be empty".to_string());
        }
        if self.start_time == self.stop_time {
            return fail(format!(
                "start_time and stop_time must differ (both {})",
                self.start_time
            ));
        }

        if self.int_time_step == 0 {
            return fail("int_time_step must be greater than zero".to_string());
        }
        if self.min_int_time >= self.max_int_time {
            return fail(format!(
                "min_int_time ({}) must be less than max_int_time ({})",
                self.min_int_time, self.max_int_time
            ));
        }
        if !(self.min_int_time..=self.max_int_time).contains(&self.start_int_time) {
            return fail(format!(
                "start_int_time ({}) must lie within [{}, {}]",
                self.start_int_time, self.min_int_time, self.max_int_time
            ));
        }
        if (self.start_int_time - self.min_int_time) % self.int_time_step != 0 {
            return fail(format!(
                "start_int_time ({}) must be min_int_time plus a multiple of int_time_step ({})",
                self.start_int_time, self.int_time_step
            ));
        }
        if self.start_coadds == 0 {
            return fail("start_coadds must be at least 1".to_string());
        }
        if self.target_int == 0 {
            return fail("target_int must be greater than zero".to_string());
        }

        if !self.home_angle.is_finite() {
            return fail("home_angle must be finite".to_string());
        }
        if self.max_steps_home == 0 {
            return fail("max_steps_home must be greater than zero".to_string());
        }
        if !(self.angle_per_step.is_finite() && self.angle_per_step > 0.0) {
            return fail(format!(
                "angle_per_step must be positive, got {}",
                self.angle_per_step
            ));
        }
        if self.steps_per_spec == 0 {
            return fail("steps_per_spec must be greater than zero".to_string());
        }
        if self.specs_per_scan == 0 {
            return fail("specs_per_scan must be greater than zero".to_string());
        }

        let exposure = &self.exposure_control;
        if !(exposure.tolerance > 0.0 && exposure.tolerance < 1.0) {
            return fail(format!(
                "exposure_control.tolerance must be in (0, 1), got {}",
                exposure.tolerance
            ));
        }
        if !(exposure.saturation_level.is_finite() && exposure.saturation_level > 0.0) {
            return fail("exposure_control.saturation_level must be positive".to_string());
        }
        if exposure.max_coadds < self.start_coadds {
            return fail(format!(
                "exposure_control.max_coadds ({}) must be at least start_coadds ({})",
                exposure.max_coadds, self.start_coadds
            ));
        }

        let fit = &self.fit_control;
        if !(fit.fit_window[0].is_finite()
            && fit.fit_window[1].is_finite()
            && fit.fit_window[0] < fit.fit_window[1])
        {
            return fail(format!(
                "fit_control.fit_window must be an increasing pair, got {:?}",
                fit.fit_window
            ));
        }
        if fit.max_iterations == 0 {
            return fail("fit_control.max_iterations must be greater than zero".to_string());
        }
        if !(fit.tolerance > 0.0 && fit.tolerance.is_finite()) {
            return fail("fit_control.tolerance must be positive".to_string());
        }
        if fit.fit_threads == 0 {
            return fail("fit_control.fit_threads must be at least 1".to_string());
        }

        self.fit_parameters.validate()
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(text: &str) -> Result<Self, StationError> {
        let config = Config::builder()
            .add_source(File::from_str(text, FileFormat::Toml))
            .build()?;
        let station = config.try_deserialize::<StationConfig>()?;
        station.validate()?;
        Ok(station)
    }

    pub fn to_toml_string(&self) -> Result<String, StationError> {
        Ok(toml::to_string(self)?)
    }
}

/// Load the station configuration. An explicit path must exist; otherwise
/// the usual locations are tried in order. `SCAN_STATION__*` environment
/// variables override file values.
pub fn load_config(config_path: Option<&Path>) -> Result<StationConfig, StationError> {
    let mut builder = Config::builder();

    if let Some(path) = config_path {
        if !path.exists() {
            return Err(StationError::Configuration(format!(
                "Config file not found: {}",
                path.display()
            )));
        }
        builder = builder.add_source(File::from(path));
    } else {
        let possible_paths = ["station.toml", "config/station.toml"];
        let found = possible_paths.iter().find(|p| Path::new(p).exists());
        match found {
            Some(path) => builder = builder.add_source(File::with_name(path)),
            None => {
                return Err(StationError::Configuration(
                    "No configuration file found (tried station.toml, config/station.toml)"
                        .to_string(),
                ));
            }
        }
    }

    builder = builder.add_source(
        Environment::with_prefix("SCAN_STATION")
            .separator("__")
            .try_parsing(true),
    );

    let station = builder.build()?.try_deserialize::<StationConfig>()?;
    station.validate()?;

    log::info!(
        "Configuration loaded for station '{}' ({} fit parameters)",
        station.station_name,
        station.fit_parameters.len()
    );
    Ok(station)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const SAMPLE: &str = r#"
station_name = "ETNA_NE"
start_time = "06:30"
stop_time = "17:45"
start_int_time = 100
start_coadds = 1
min_int_time = 50
max_int_time = 1000
int_time_step = 50
target_int = 40000
home_angle = 180.0
steps_to_start = 50
switch_pin = 21
max_steps_home = 2000
step_type = "half"
angle_per_step = 0.9
steps_per_spec = 1
specs_per_scan = 101

[fit_parameters]
bg_poly0 = { value = 1.0 }
bg_poly1 = { value = 1.0 }
bg_poly2 = { value = 1.0 }
bg_poly3 = { value = 1.0 }
offset0 = { value = 0.0 }
shift0 = { value = -0.2 }
shift1 = { value = 0.05 }
ring = { value = 1.0, xpath = "Ref/ring.txt" }
so2 = { value = 1.0e16, xpath = "Ref/so2.txt", lo_bound = -1.0e19, hi_bound = 1.0e20 }
o3 = { value = 1.0e19, xpath = "Ref/o3.txt", vary = false }
"#;

    #[test]
    fn test_parse_sample_config() {
        let cfg = StationConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(cfg.station_name, "ETNA_NE");
        assert_eq!(cfg.start_time, DailyTime::from_hm(6, 30).unwrap());
        assert_eq!(cfg.step_type, StepType::Half);
        assert_eq!(cfg.specs_per_scan, 101);
        assert_eq!(cfg.fit_control, FitControlConfig::default());
        assert_eq!(cfg.status_dir, PathBuf::from("Station"));
    }

    #[test]
    fn test_fit_parameter_order_and_terms() {
        let cfg = StationConfig::from_toml_str(SAMPLE).unwrap();
        let names: Vec<&str> = cfg.fit_parameters.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "bg_poly0", "bg_poly1", "bg_poly2", "bg_poly3", "offset0", "shift0", "shift1",
                "ring", "so2", "o3"
            ]
        );

        let so2 = cfg.fit_parameters.get("SO2").unwrap();
        assert_eq!(
            so2.term,
            FitTerm::Absorber {
                xpath: PathBuf::from("Ref/so2.txt")
            }
        );
        assert_eq!(so2.hi_bound, Some(1.0e20));
        assert!(!cfg.fit_parameters.get("o3").unwrap().vary);
        assert_eq!(
            cfg.fit_parameters.get("bg_poly2").unwrap().term,
            FitTerm::Background { order: 2 }
        );
        assert_eq!(
            cfg.fit_parameters.get("shift1").unwrap().term,
            FitTerm::Shift { order: 1 }
        );
        assert_eq!(cfg.fit_parameters.absorbers().count(), 3);
    }

    #[test]
    fn test_round_trip_is_bit_identical() {
        let cfg = StationConfig::from_toml_str(SAMPLE).unwrap();
        let text = cfg.to_toml_string().unwrap();
        let reparsed = StationConfig::from_toml_str(&text).unwrap();

        assert_eq!(cfg, reparsed);
        assert_eq!(cfg.home_angle.to_bits(), reparsed.home_angle.to_bits());
        assert_eq!(cfg.angle_per_step.to_bits(), reparsed.angle_per_step.to_bits());
        for (a, b) in cfg.fit_parameters.iter().zip(reparsed.fit_parameters.iter()) {
            assert_eq!(a.name, b.name);
            assert_eq!(a.value.to_bits(), b.value.to_bits());
        }
    }

    #[test]
    fn test_structural_name_without_xpath_required() {
        let text = SAMPLE.replace(
            "ring = { value = 1.0, xpath = \"Ref/ring.txt\" }",
            "ring = { value = 1.0 }",
        );
        let err = StationConfig::from_toml_str(&text).unwrap_err();
        assert!(matches!(err, StationError::Configuration(_)));
    }

    #[test]
    fn test_polynomial_order_limit() {
        let text = SAMPLE.replace("bg_poly3 = { value = 1.0 }", "bg_poly99 = { value = 1.0 }");
        let err = StationConfig::from_toml_str(&text).unwrap_err();
        assert!(matches!(err, StationError::Configuration(_)));

        let text = SAMPLE.replace(
            "shift1 = { value = 0.05 }",
            &format!("shift{MAX_TERM_ORDER} = {{ value = 0.0 }}"),
        );
        let cfg = StationConfig::from_toml_str(&text).unwrap();
        assert_eq!(
            cfg.fit_parameters.get("shift10").unwrap().term.order(),
            Some(MAX_TERM_ORDER)
        );
    }

    #[test]
    fn test_int_time_bounds_rejected() {
        let text = SAMPLE.replace("max_int_time = 1000", "max_int_time = 40");
        assert!(matches!(
            StationConfig::from_toml_str(&text),
            Err(StationError::Configuration(_))
        ));

        let text = SAMPLE.replace("start_int_time = 100", "start_int_time = 120");
        assert!(matches!(
            StationConfig::from_toml_str(&text),
            Err(StationError::Configuration(_))
        ));

        let text = SAMPLE.replace("int_time_step = 50", "int_time_step = 0");
        assert!(StationConfig::from_toml_str(&text).is_err());
    }

    #[test]
    fn test_geometry_bounds_rejected() {
        for (from, to) in [
            ("angle_per_step = 0.9", "angle_per_step = 0.0"),
            ("steps_per_spec = 1", "steps_per_spec = 0"),
            ("specs_per_scan = 101", "specs_per_scan = 0"),
            ("max_steps_home = 2000", "max_steps_home = 0"),
            ("steps_to_start = 50", "steps_to_start = -3"),
            ("start_coadds = 1", "start_coadds = 0"),
            ("stop_time = \"17:45\"", "stop_time = \"06:30\""),
            ("start_time = \"06:30\"", "start_time = \"6.30am\""),
        ] {
            let text = SAMPLE.replace(from, to);
            assert!(
                StationConfig::from_toml_str(&text).is_err(),
                "expected rejection for {to}"
            );
        }
    }

    #[test]
    fn test_initial_value_outside_bounds_rejected() {
        let text = SAMPLE.replace("value = 1.0e16", "value = 1.0e21");
        assert!(StationConfig::from_toml_str(&text).is_err());
    }

    #[test]
    fn test_window_contains() {
        let start = DailyTime::from_hm(6, 0).unwrap();
        let stop = DailyTime::from_hm(18, 0).unwrap();
        let at = |h, m| NaiveTime::from_hms_opt(h, m, 0).unwrap();

        assert!(DailyTime::window_contains(start, stop, at(6, 0)));
        assert!(DailyTime::window_contains(start, stop, at(12, 0)));
        assert!(DailyTime::window_contains(start, stop, at(18, 0)));
        assert!(!DailyTime::window_contains(start, stop, at(18, 1)));
        assert!(!DailyTime::window_contains(start, stop, at(5, 59)));

        // Overnight window
        assert!(DailyTime::window_contains(stop, start, at(23, 0)));
        assert!(DailyTime::window_contains(stop, start, at(3, 0)));
        assert!(!DailyTime::window_contains(stop, start, at(12, 0)));
    }

    #[test]
    fn test_missing_config_file() {
        let err = load_config(Some(Path::new("/nonexistent/station.toml"))).unwrap_err();
        assert!(matches!(err, StationError::Configuration(_)));
    }
}
