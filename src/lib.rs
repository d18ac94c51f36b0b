//! Core library for the flashrig programming/testing station.
//!
//! This library contains the event broker, the step pipeline, the device
//! protocol engines and the workflow orchestrator driving one industrial
//! test/programming bench. The HTTP and UI layers live outside and reach the
//! station exclusively through [`programmer::Programmer`] and the broker
//! topics it publishes.

pub mod broker;
pub mod error;
pub mod glp2;
pub mod lpt;
pub mod pipeline;
pub mod program;
pub mod programmer;
pub mod run;
pub mod sdp;
pub mod services;
pub mod settings;
pub mod sol;
