//! # rcabench-viewer
//!
//! Streaming viewer for Arrow result files of the RCA benchmark:
//!
//! - **Codecs**: body-buffer decompression for compressed IPC streams
//! - **Stream decoding**: incremental framing of Arrow IPC over HTTP
//! - **Load sessions**: progressive loading into a table engine with
//!   progress reporting, cancellation and duplicate suppression
//! - **Viewer hosts**: binding loaded tables to a display widget

pub mod api;
pub mod codec;
pub mod config;
pub mod consumer;
pub mod engine;
pub mod error;
pub mod ipc_stream;
pub mod session;
pub mod viewer;

#[cfg(test)]
mod testing;

pub use self::{
    api::{DataApi, FileStream, HttpDataApi},
    config::Config,
    consumer::StreamProgress,
    engine::{TableEngine, TableHandle, shared_worker},
    error::LoadError,
    session::{ErrorPanel, LoadController, LoadKey, LoadPhase, RenderProps, ViewState},
    viewer::{DisplayConfig, TableRef, ViewerHost},
};
