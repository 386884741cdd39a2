//! An answer panel: normalize, render, commit, typeset.

use std::sync::Arc;

use crate::markdown::render_answer;
use crate::mathml::Container;
use crate::normalize::{NormalizedText, normalize};
use crate::typeset::{SchedulerConfig, TypesetHandle, TypesetScheduler, TypesetStatus, Typesetter};

/// Shows one AI answer and keeps its math typeset.
///
/// Must be mounted inside a tokio runtime. Dropping the view tears its
/// scheduler down.
pub struct AnswerView {
    container: Container,
    current: Option<NormalizedText>,
    typeset: TypesetHandle,
}

impl AnswerView {
    pub fn mount<T>(engine: Arc<T>, config: SchedulerConfig) -> Self
    where
        T: Typesetter<Scope = Container>,
    {
        let container = Container::new();
        let typeset = TypesetScheduler::new(engine, container.clone(), config).spawn();
        Self {
            container,
            current: None,
            typeset,
        }
    }

    /// Shows `raw`. Returns `false` if it normalizes to what is already shown,
    /// in which case nothing is re-rendered or re-typeset.
    pub fn set_content(&mut self, raw: &str) -> bool {
        let normalized = normalize(raw);
        if self.current.as_ref() == Some(&normalized) {
            return false;
        }
        self.container.commit(render_answer(&normalized));
        self.current = Some(normalized);
        self.typeset.content_changed();
        true
    }

    pub fn content(&self) -> Option<&NormalizedText> {
        self.current.as_ref()
    }

    pub fn container(&self) -> &Container {
        &self.container
    }

    pub fn visible(&self) -> String {
        self.container.visible()
    }

    pub fn status(&self) -> TypesetStatus {
        self.typeset.status()
    }

    pub async fn settled(&self) {
        self.typeset.settled().await
    }

    /// Tears down and waits for any in-flight pass to finish.
    pub async fn unmount(self) {
        self.typeset.shutdown().await
    }
}
