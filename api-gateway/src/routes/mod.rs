//! HTTP handlers, one module per resource.

pub mod anchors;
pub mod batches;
pub mod evidence;
pub mod health;
pub mod receipts;
