//! Profiler runtime: buffer sizing, tailing and dispatch.
//!
//! ```text
//!                   ┌─────────────┐  grow() on overflow
//!                   │ BufferSizer │◄──────────────────┐
//!                   └──────┬──────┘                   │
//!          system.profile  │ (capped, +1 MiB)         │
//!                   ┌──────▼──────┐   observe(ts) ┌───┴──────┐
//!                   │  tailable   ├──────────────►│  Tailer  │──► Watermark
//!                   │   cursor    │               └───┬──────┘
//!                   └─────────────┘                   │ send (never waits)
//!                                              ┌──────▼──────┐
//!                                              │ Dispatcher  │ drop-oldest queue
//!                                              └──────┬──────┘
//!                                          N workers  │
//!                                              ┌──────▼──────┐
//!                                              │EntryHandler │
//!                                              └─────────────┘
//! ```
//!
//! States of the tailer:
//!
//! ```text
//! Uninitialized ──open ok──► CursorActive ──entry──► CursorActive
//!       ▲     └──open err──┐      │
//!       │                  ▼      ├─ exhausted ─────────────┐
//!       └── deadline ── AwaitingRetry ◄── overflow + grow ──┤
//!                          │                                │
//!                         stop ──► Stopped ◄── stop (any state)
//! ```
//!
//! Any other cursor error ends the run with an error.

mod dispatch;
mod sizing;
mod tailer;
mod watermark;

pub use dispatch::{DispatchSender, Dispatcher, EntryHandler};
pub use sizing::BufferSizer;
pub use tailer::{Tailer, TailerHandle, TailerState, cursor_filter};
pub use watermark::Watermark;
