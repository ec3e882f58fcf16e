//! Models for the MVIDS intrusion-detection pipeline.
//!
//! Two model families share this crate:
//!
//! - **Multi-view feature learning**: three attention-based
//!   [`views::FeatureView`]s encode every flow, and [`fusion::CrossViewFusion`]
//!   combines them with learned per-sample view weights
//!   ([`mvfl::MvflEncoder`]).
//! - **Dynamic ensemble**: a [`bank::ClassifierBank`] of four heterogeneous
//!   classifiers, a learned [`router::Router`] and the confidence-gated
//!   [`ensemble::EnsembleCombiner`] with its anomaly-detector fallback.
//!
//! Supporting modules cover temperature calibration, minority-class
//! balancing, parameter bundles and device selection.
//!
//! # Feature Flags
//!
//! - `cuda` / `metal`: GPU back ends for candle (see [`device::select_device`]).

pub mod attention;
pub mod balance;
pub mod bank;
pub mod bundle;
pub mod calibration;
pub mod device;
pub mod ensemble;
pub mod fusion;
pub mod mvfl;
pub mod router;
pub mod tensor;
pub mod views;

pub use balance::{balance, BalanceReport, InterpolatingSynthesizer, SampleSynthesizer};
pub use bank::{
    ClassifierBank, ClassifierKind, ClassifierOutput, LogitModel, ProbabilisticClassifier,
};
pub use bundle::ParamBundle;
pub use calibration::{fit_temperature, Calibrated, TemperatureFit};
pub use ensemble::{inverse_loss_weights, DynamicEnsemble, EnsembleCombiner, EnsembleDecision};
pub use fusion::{CrossViewFusion, FusionOutput};
pub use mvfl::MvflEncoder;
pub use router::Router;
pub use views::{FeatureView, ViewKind};
