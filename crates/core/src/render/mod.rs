use serde::Serialize;

use crate::binding::{AnimationBinding, BindingSnapshot};
use crate::scheduler::BeatScheduler;
use crate::timeline::Millis;
use crate::{Phase, Result};

/// One named binding as the renderer sees it.
#[derive(Debug, Clone, Serialize)]
pub struct LayerFrame {
    pub name: String,
    #[serde(flatten)]
    pub snapshot: BindingSnapshot,
    /// Progress through the running transition, if any.
    pub progress: Option<f64>,
}

/// Everything the rendering layer needs for one frame.
#[derive(Debug, Clone, Serialize)]
pub struct RenderFrame {
    pub time_ms: Millis,
    pub phase: Phase,
    pub layers: Vec<LayerFrame>,
}

impl RenderFrame {
    /// Single-line JSON, one frame per line.
    pub fn to_json_line(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Read side of the animation core: owns the named bindings of a page and
/// samples them into [`RenderFrame`]s.
#[derive(Debug, Default)]
pub struct RenderGraph {
    layers: Vec<(String, AnimationBinding)>,
}

impl RenderGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches `binding` to `scheduler` and keeps it under `name`.
    pub fn mount(
        &mut self,
        name: impl Into<String>,
        mut binding: AnimationBinding,
        scheduler: &BeatScheduler,
    ) -> Result<()> {
        let name = name.into();
        binding.attach(scheduler)?;
        tracing::debug!(layer = %name, "layer mounted");
        self.layers.push((name, binding));
        Ok(())
    }

    /// Detaches and drops the layer called `name`.
    pub fn unmount(&mut self, name: &str) -> bool {
        let Some(index) = self.layers.iter().position(|(layer, _)| layer == name) else {
            return false;
        };
        let (_, mut binding) = self.layers.remove(index);
        binding.detach();
        tracing::debug!(layer = name, "layer unmounted");
        true
    }

    pub fn binding(&self, name: &str) -> Option<&AnimationBinding> {
        self.layers
            .iter()
            .find(|(layer, _)| layer == name)
            .map(|(_, binding)| binding)
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn frame(&self, scheduler: &BeatScheduler) -> RenderFrame {
        let now = scheduler.now_ms();
        RenderFrame {
            time_ms: now,
            phase: scheduler.current_phase(),
            layers: self
                .layers
                .iter()
                .map(|(name, binding)| LayerFrame {
                    name: name.clone(),
                    snapshot: binding.snapshot(),
                    progress: binding.progress(now),
                })
                .collect(),
        }
    }
}
