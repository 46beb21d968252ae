#![deny(dead_code)]
#![deny(unused_imports)]
#![allow(non_snake_case)]

//! Bayesian imputation of clinical-trial site enrolment rates.
//!
//! Sites whose enrolment speed is missing or falls outside a robust IQR fence
//! are treated as latent. A linear-Gaussian model is fitted to the remaining
//! sites with NUTS, and its posterior yields a predictive distribution for
//! every excluded site, validated with Pareto-smoothed leave-one-out.

pub mod config;
pub mod data;
pub mod diagnostics;
pub mod fence;
pub mod hmc;
pub mod imputation;
pub mod loo;
pub mod metric;
pub mod model;
pub mod normalize;
pub mod pipeline;
pub mod posterior;
pub mod report;
pub mod synthetic;
pub mod types;
