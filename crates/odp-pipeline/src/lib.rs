//! Distributed bulk dataset import pipeline
//!
//! Coordinates asynchronous stage workers through a topic-routed queue
//! dispatcher to import multi-table dataset snapshots:
//!
//! 1. **download_files**: fetch and unpack the snapshot, announce one
//!    transform message per whitelisted table.
//! 2. **transform_data**: parse a table file, record its expected row
//!    and chunk counts, fan the rows out as bounded chunk messages.
//! 3. **save_data**: append one chunk into the table's staging copy.
//! 4. **check_done**: counted completion barrier; when every announced
//!    table has drained, the verifier compares expected against actual
//!    row counts and promotes staging to production only on exact match.
//!
//! All cross-stage state travels in message payloads or the metadata
//! catalog, so any worker can restart without losing a version.

pub mod config;
pub mod messages;
pub mod source;
pub mod stages;
pub mod store;
pub mod verify;

pub use config::{BarrierConfig, PipelineConfig, SourceConfig};
pub use stages::{register_stages, StageContext};
pub use verify::{Verifier, VerifyOutcome};
