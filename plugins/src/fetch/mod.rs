//! Remote document fetching as a task tree: optional accession conversion,
//! a parallel sequence + feature-sources phase, structural-dedup merging,
//! and a persist step scheduled only once all data is loaded.

mod convert;
mod document;
mod features;
mod model;
mod object;
mod payload;
mod source;

pub use convert::{ConvertIdTask, ConvertedId};
pub use document::{ConvertIdAndFetchDocumentTask, FetchDocumentTask, PersistTask};
pub use features::FetchFeaturesTask;
pub use model::{Annotation, AnnotationGroups, FetchedDocument, FetchedSequence, Strand};
pub use object::{FetchObjectTask, ObjectKind};
pub use source::{FetchKind, HttpSource, ProgressFn, RemoteSource};
