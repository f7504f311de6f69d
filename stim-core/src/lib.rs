#![no_std]

extern crate alloc;

// Shared logic for the stimulation sequencer.
//
// This crate stays portable across the operator console and any embedded
// host by avoiding the Rust standard library. Hardware, recording, clock, and
// event-log access are expressed as traits the front-ends implement.

pub mod device;
pub mod electrodes;
pub mod executor;
pub mod orchestrator;
pub mod recording;
pub mod repl;
pub mod sequences;
pub mod telemetry;
