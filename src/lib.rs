pub mod config;
pub mod error;
pub mod exposure;
pub mod fit;
pub mod hardware;
pub mod plotting;
pub mod record;
pub mod scanner;
pub mod session;
pub mod station;
pub mod status;
pub mod types;

pub use config::{
    load_config, DailyTime, FitControlConfig, FitParameterSpec, FitParameterTable, FitTerm,
    StationConfig,
};
pub use error::StationError;
pub use exposure::{ExposureAdjustment, ExposureController, IntensityReading};
pub use fit::{CrossSection, FitEngine, FitResult, FitStatus, FittedParameter};
pub use hardware::{HardwareAdapter, SimulatedHardware, SimulatedScene};
pub use plotting::{plot_profile, plot_record};
pub use record::{Completion, OpenScanRecord, ScanEntry, ScanRecord};
pub use scanner::{AcquisitionHandler, ScanController, ScanGeometry, ScanState};
pub use session::{FitDispatcher, ScanSession, SessionOutcome};
pub use station::{DailyRun, Station};
pub use status::{StationStatus, StatusFile, StatusReport};
pub use types::{ExposureSetting, MotorDirection, RawSpectrum, ScanPosition, StepType};
