//! spotgrid-predictor: the scoring capability the decision engine calls.
//!
//! The engine owns no model. It hands a [`Features`] vector to whatever
//! [`Predictor`] the configuration selected and gets back an
//! interruption probability, a price trend and a confidence. Absence is
//! a normal outcome: any error, including a timeout enforced by the
//! caller, sends the engine to its rule-based fallback.
//!
//! # Implementations
//!
//! | kind     | type                     |
//! |----------|--------------------------|
//! | `none`   | [`UnavailablePredictor`] |
//! | `static` | [`StaticPredictor`]      |
//! | `http`   | [`HttpPredictor`]        |

pub mod error;
pub mod http;
pub mod predictor;

pub use error::{PredictorError, PredictorResult};
pub use http::HttpPredictor;
pub use predictor::{
    Features, Predictor, PredictorScore, SharedPredictor, StaticPredictor, UnavailablePredictor,
    build_predictor,
};
