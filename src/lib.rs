//! Correlation-and-issuance engine for realtime clients.
//!
//! A client connects over WebSocket and receives a correlation id, posts a
//! comment `<id>:<application key>` on the configured CodePen pen, then
//! sends `notify`. The [`engine`] polls the pen, mints a signed token bound to
//! the commenter's identity, delivers it through the [`gateway`] and deletes
//! the comment.

#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::assigning_clones,
    clippy::bool_to_int_with_if,
    clippy::cast_possible_wrap,
    clippy::doc_markdown,
    clippy::field_reassign_with_default,
    clippy::implicit_clone,
    clippy::items_after_statements,
    clippy::map_unwrap_or,
    clippy::manual_let_else,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::new_without_default,
    clippy::needless_pass_by_value,
    clippy::needless_raw_string_hashes,
    clippy::redundant_closure_for_method_calls,
    clippy::return_self_not_must_use,
    clippy::similar_names,
    clippy::single_match_else,
    clippy::struct_field_names,
    clippy::too_many_lines,
    clippy::uninlined_format_args,
    clippy::unnecessary_cast,
    clippy::unnecessary_lazy_evaluations,
    clippy::unnecessary_literal_bound,
    clippy::unnecessary_map_or,
    clippy::unused_self,
    clippy::unnecessary_wraps,
    dead_code
)]

pub mod config;
pub mod daemon;
pub mod engine;
pub mod gateway;
pub mod registry;
pub mod source;
pub mod token;
