// Copyright 2024 the tjs authors. MIT license.

//! Component B: the TLS pipe driver (spec §4.B).
//!
//! `rustls`'s sans-I/O `Connection` is exactly the engine described by
//! the spec's protocol contract: `read_tls`/`write_tls` move bytes
//! between socket and engine, `process_new_packets` steps the state
//! machine and may only consume a prefix of what `read_tls` buffered,
//! and plaintext comes out through `reader()`. This module is the
//! explicit pending-ciphertext accounting the spec calls out as
//! "mandatory" — §4.B "Rationale".

mod context;
mod pipe;

pub use context::default_client_options as context_options_for_client;
pub use context::TlsContext;
pub use context::TlsContextOptions;
pub use context::TlsMode;
pub use pipe::drive_handshake;
pub use pipe::read_plaintext;
pub use pipe::write_plaintext;
pub use pipe::Pipe;
pub use pipe::RawIo;
