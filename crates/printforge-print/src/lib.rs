// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Printforge Print: persistent job queue, printer device adapters and the
// background agent that drives jobs from the queue onto a printer.  Domain
// types live in `printforge-core`; this crate owns all the moving parts.

pub mod agent;
pub mod device;
pub mod queue;
pub mod retry;
pub mod simulator;

pub use agent::PrinterAgent;
pub use device::DeviceAdapter;
pub use queue::PrintQueue;
pub use retry::RetryPolicy;
pub use simulator::SimulatedPrinter;
