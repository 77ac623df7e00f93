//! Wire codecs (C3, C4). Each submodule is pure and stateless except for
//! the G-Series process-wide serial counter (see `crate::time`).

pub mod gseries;
pub mod ttseries;
