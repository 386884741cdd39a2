//! Tutor answer renderer
//!
//! Turns the raw text a language model returns for a homework question into
//! HTML with properly fenced math, and keeps that math typeset as answers
//! change.
//!
//! Pipeline: [`normalize`] repairs the model's LaTeX fencing,
//! [`render_answer`] turns it into HTML with math left as fenced text, and a
//! [`TypesetScheduler`] hands the committed markup to a [`Typesetter`].
//! [`AnswerView`] wires the three together for one answer panel.

pub mod document;
pub mod error;
pub mod markdown;
pub mod mathml;
pub mod normalize;
pub mod typeset;
pub mod view;

pub use error::TypesetError;
pub use markdown::{MathMode, render_answer};
pub use mathml::{Container, MathmlTypesetter};
pub use normalize::{NormalizedText, normalize};
pub use typeset::{
    SchedulerConfig, TypesetHandle, TypesetScheduler, TypesetState, TypesetStatus, Typesetter,
};
pub use view::AnswerView;
