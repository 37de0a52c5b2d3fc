pub mod consultations;
pub mod database;
pub mod error;
pub mod jobs;
pub mod row_helpers;
pub mod schema;

pub use consultations::ConsultationRepo;
pub use database::Database;
pub use error::StoreError;
pub use jobs::{JobRepo, JobStateStore, JobSummary};
