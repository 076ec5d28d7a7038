//! The ordered stages one frame of simulation goes through.

/// One phase of the simulation pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Stage {
    RegisterSystems,
    BuildSystems,
    InitScene,
    RebuildScene,
    PredictMotion,
    ComputeGradientHessian,
    SolveGlobalLinearSystem,
    LineSearch,
    UpdateVelocity,
}

impl Stage {
    /// Whether the pipeline may go directly from `self` to `next`.
    pub fn can_advance_to(self, next: Stage) -> bool {
        use Stage::*;
        matches!(
            (self, next),
            (RegisterSystems, BuildSystems)
                | (BuildSystems, InitScene)
                | (InitScene, PredictMotion)
                | (InitScene, RebuildScene)
                | (RebuildScene, PredictMotion)
                | (PredictMotion, ComputeGradientHessian)
                | (ComputeGradientHessian, SolveGlobalLinearSystem)
                | (SolveGlobalLinearSystem, LineSearch)
                | (LineSearch, ComputeGradientHessian)
                | (LineSearch, UpdateVelocity)
                | (UpdateVelocity, PredictMotion)
                | (UpdateVelocity, RebuildScene)
        )
    }
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Invalid stage transition {from:?} -> {to:?}")]
pub struct StageError {
    pub from: Stage,
    pub to: Stage,
}

/// Tracks the current stage and rejects out-of-order transitions.
///
/// Only the engine owns one of these.
/// Subsystems observe the stage but never change it.
#[derive(Clone, Debug)]
pub struct StageMachine {
    current: Stage,
    frame: usize,
    newton_iter: usize,
}

impl Default for StageMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StageMachine {
    pub fn new() -> Self {
        StageMachine {
            current: Stage::RegisterSystems,
            frame: 0,
            newton_iter: 0,
        }
    }

    #[inline]
    pub fn current(&self) -> Stage {
        self.current
    }

    /// Number of frames completed so far.
    #[inline]
    pub fn frame(&self) -> usize {
        self.frame
    }

    /// Newton iteration within the current substep, counted on each
    /// entry to [`Stage::ComputeGradientHessian`].
    #[inline]
    pub fn newton_iter(&self) -> usize {
        self.newton_iter
    }

    pub fn transition(&mut self, to: Stage) -> Result<(), StageError> {
        if !self.current.can_advance_to(to) {
            return Err(StageError {
                from: self.current,
                to,
            });
        }
        match to {
            Stage::PredictMotion => self.newton_iter = 0,
            Stage::ComputeGradientHessian => self.newton_iter += 1,
            _ => (),
        }
        self.current = to;
        Ok(())
    }

    pub(crate) fn finish_frame(&mut self) {
        self.frame += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use Stage::*;

    /// A full frame with two Newton iterations walks the allowed path.
    #[test]
    fn newton_loop_path() {
        let mut sm = StageMachine::new();
        for stage in [
            BuildSystems,
            InitScene,
            PredictMotion,
            ComputeGradientHessian,
            SolveGlobalLinearSystem,
            LineSearch,
            ComputeGradientHessian,
            SolveGlobalLinearSystem,
            LineSearch,
            UpdateVelocity,
            RebuildScene,
            PredictMotion,
        ] {
            sm.transition(stage).unwrap();
        }
        assert_eq!(sm.current(), PredictMotion);
        assert_eq!(sm.newton_iter(), 0);
    }

    #[test]
    fn skipping_stages_is_rejected() {
        let mut sm = StageMachine::new();
        assert_eq!(
            sm.transition(InitScene),
            Err(StageError {
                from: RegisterSystems,
                to: InitScene
            })
        );
        sm.transition(BuildSystems).unwrap();
        sm.transition(InitScene).unwrap();
        sm.transition(PredictMotion).unwrap();
        assert!(sm.transition(LineSearch).is_err());
        assert_eq!(sm.current(), PredictMotion);
    }

    #[test]
    fn counts_newton_iterations() {
        let mut sm = StageMachine::new();
        for stage in [BuildSystems, InitScene, PredictMotion] {
            sm.transition(stage).unwrap();
        }
        for _ in 0..3 {
            sm.transition(ComputeGradientHessian).unwrap();
            sm.transition(SolveGlobalLinearSystem).unwrap();
            sm.transition(LineSearch).unwrap();
        }
        assert_eq!(sm.newton_iter(), 3);
    }
}
