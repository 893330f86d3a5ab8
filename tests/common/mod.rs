#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use mathcell::{Session, Settings};

pub fn settings() -> Settings {
    Settings {
        worker_binary: Some(PathBuf::from(env!("CARGO_BIN_EXE_mathcell"))),
        eval_timeout: Duration::from_secs(10),
        shutdown_grace: Duration::from_secs(1),
        ..Settings::default()
    }
}

pub fn session(settings: Settings) -> Arc<Session> {
    Arc::new(Session::new("test", Arc::new(settings)))
}

/// Evaluate with output captured and no LaTeX.
pub async fn eval(session: &Session, code: &str) -> Result<mathcell::WorkerResult, mathcell::CellError> {
    session.evaluate(code, false, true, None).await
}
