mod tokio_launcher;

pub use tokio_launcher::TokioProcessLauncher;
