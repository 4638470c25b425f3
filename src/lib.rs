mod completion;
mod config;
mod diagnostics;
mod errors;
mod geocoding;
mod journal;
mod normalizer;
mod pipeline;
mod quota;
mod refiner;
mod resolver;
mod secrets;
mod table;

use once_cell::sync::OnceCell;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use completion::{GeminiClient, TextCompletion};
pub use config::{AppConfig, PublicAppConfig, REQUEST_LIMIT};
pub use diagnostics::{Diagnostic, Diagnostics, Severity, Stage};
pub use errors::{AppError, AppResult};
pub use geocoding::{GeocodeCandidate, GeocodingService, GoogleGeocodingClient, LocationType};
pub use journal::RunJournal;
pub use normalizer::AddressNormalizer;
pub use pipeline::{
    GeocodePipeline, OutputRecord, PipelineServices, ProgressObserver, RecordOutcome, RunProgress,
    RunReport, RunStats,
};
pub use quota::{current_month, FileQuotaStore, MemoryQuotaStore, QuotaState, QuotaStore};
pub use refiner::CoordinateRefiner;
pub use resolver::{select_candidate, CoordinateResolver, Resolution, ResolvedLocation};
pub use secrets::{Credential, SecretVault};
pub use table::{default_output_name, AddressRecord, AddressTable, GeocodedTable};

pub const VAULT_SERVICE_NAME: &str = "BatchGeocoder";

pub fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,batch_geocoder=debug"));
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    });
}
