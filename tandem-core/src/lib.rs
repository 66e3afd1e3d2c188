//! # tandem-core: Replicated text engine for Tandem
//!
//! A sequence CRDT for plain text plus the binding that connects it to an
//! editor widget. No I/O and no async runtime; the network layer lives in
//! `tandem-collab`.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  LocalEdit   ┌──────────────┐  Operation  ┌─────────────┐
//! │ EditorView   │ ───────────► │ LocalBinding │ ──────────► │   network   │
//! │ (widget)     │ ◄─────────── │ (guarded)    │ ◄────────── │             │
//! └──────────────┘  TextChange  └──────┬───────┘             └─────────────┘
//!                                      │
//!                                      ▼
//!                               ┌──────────────┐
//!                               │  Document    │  arena of runs + id index
//!                               │  (replica)   │  state vector, op log,
//!                               └──────────────┘  pending buffer
//! ```
//!
//! ## Modules
//!
//! - [`ids`]: Client and character identifiers
//! - [`state_vector`]: Per-client progress summary
//! - [`ops`]: Insert/delete operations exchanged between replicas
//! - [`document`]: The replicated text structure
//! - [`binding`]: Editor bridge with feedback-loop suppression
//!
//! ## Performance Targets
//!
//! | Metric | Target |
//! |--------|--------|
//! | Local insert (10K char doc) | <5μs |
//! | Remote op lookup by id | O(log n) |
//! | Merge 1K concurrent ops | <10ms |

pub mod binding;
pub mod document;
pub mod ids;
pub mod ops;
pub mod state_vector;

pub use binding::{
    EditorView, LocalBinding, LocalChangeHandler, LocalEdit, ReentrancyGuard, SharedDocument,
};
pub use document::{ApplyOutcome, ApplyStatus, DocError, Document, TextChange, DEFAULT_MAX_PENDING};
pub use ids::{ClientId, ItemId, ItemRange};
pub use ops::Operation;
pub use state_vector::StateVector;
