use crate::models::{CreateTaskPayload, Quadrant};

// Gate for the quadrant-selection dialog. The draft never reaches storage
// until a quadrant has been selected exactly once.
#[derive(Debug, Clone)]
pub enum ClassifierState {
    Idle,
    Awaiting {
        draft: CreateTaskPayload,
        submitting: bool,
    },
    Classified,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct ClassifierFlow {
    state: ClassifierState,
}

impl ClassifierFlow {
    pub fn new() -> Self {
        Self {
            state: ClassifierState::Idle,
        }
    }

    pub fn state(&self) -> &ClassifierState {
        &self.state
    }

    pub fn is_awaiting(&self) -> bool {
        matches!(self.state, ClassifierState::Awaiting { .. })
    }

    pub fn is_submitting(&self) -> bool {
        matches!(self.state, ClassifierState::Awaiting { submitting: true, .. })
    }

    pub fn is_classified(&self) -> bool {
        matches!(self.state, ClassifierState::Classified)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.state, ClassifierState::Cancelled)
    }

    pub fn begin(&mut self, draft: CreateTaskPayload) -> bool {
        match self.state {
            ClassifierState::Idle => {
                self.state = ClassifierState::Awaiting {
                    draft,
                    submitting: false,
                };
                true
            }
            _ => false,
        }
    }

    // Returns the finalized payload exactly once; repeat selections while a
    // submission is in flight are ignored.
    pub fn select(&mut self, quadrant: Quadrant) -> Option<CreateTaskPayload> {
        match &mut self.state {
            ClassifierState::Awaiting { draft, submitting } if !*submitting => {
                *submitting = true;
                let mut payload = draft.clone();
                payload.quadrant = Some(quadrant);
                Some(payload)
            }
            _ => None,
        }
    }

    pub fn submission_failed(&mut self) {
        if let ClassifierState::Awaiting { submitting, .. } = &mut self.state {
            *submitting = false;
        }
    }

    pub fn mark_submitted(&mut self) {
        if matches!(self.state, ClassifierState::Awaiting { submitting: true, .. }) {
            self.state = ClassifierState::Classified;
        }
    }

    // Closing the dialog drops the draft; nothing is persisted.
    pub fn cancel(&mut self) {
        if matches!(self.state, ClassifierState::Awaiting { .. }) {
            self.state = ClassifierState::Cancelled;
        }
    }
}

impl Default for ClassifierFlow {
    fn default() -> Self {
        Self::new()
    }
}
