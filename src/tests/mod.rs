//! tests/mod.rs
//! Pruebas del motor contra SQLite real (memoria o archivo temporal).

mod campaign_tests;
mod support;
