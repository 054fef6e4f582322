//! Tracing layers

use tracing::{Subscriber, span};
use tracing_subscriber::Layer;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;

use crate::config::JsonlConfig;
use crate::context::{PeerContext, PeerContextGuard};

/// Type-erased layer, so optional outputs can be assembled at runtime
pub type BoxedLayer<S> = Box<dyn Layer<S> + Send + Sync + 'static>;

/// Attaches the active [`PeerContext`] to every new span
///
/// A span opened without an active guard inherits its parent's context,
/// so work spawned under a node's span stays attributed to that node.
#[derive(Debug, Clone, Copy, Default)]
pub struct PeerContextLayer;

impl PeerContextLayer {
    pub fn new() -> Self {
        Self
    }
}

impl<S> Layer<S> for PeerContextLayer
where
    S: Subscriber + for<'lookup> LookupSpan<'lookup>,
{
    fn on_new_span(&self, _attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else {
            return;
        };
        let context = PeerContextGuard::current().or_else(|| {
            span.parent()
                .and_then(|parent| parent.extensions().get::<PeerContext>().cloned())
        });
        if let Some(context) = context {
            span.extensions_mut().insert(context);
        }
    }
}

/// JSONL formatter writing to `writer`
pub fn jsonl_layer<S, W>(writer: W, config: &JsonlConfig) -> BoxedLayer<S>
where
    S: Subscriber + for<'lookup> LookupSpan<'lookup>,
    W: for<'writer> MakeWriter<'writer> + Send + Sync + 'static,
{
    tracing_subscriber::fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(config.include_spans)
        .flatten_event(config.flatten_events)
        .with_file(config.include_location)
        .with_line_number(config.include_location)
        .with_thread_ids(config.include_thread_info)
        .with_thread_names(config.include_thread_info)
        .with_writer(writer)
        .boxed()
}

/// Human-readable console formatter
pub fn pretty_layer<S>(ansi: bool) -> BoxedLayer<S>
where
    S: Subscriber + for<'lookup> LookupSpan<'lookup>,
{
    tracing_subscriber::fmt::layer()
        .with_ansi(ansi)
        .with_target(true)
        .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_core::SimulationIdentity;
    use std::sync::{Arc, Mutex};
    use tracing_subscriber::Registry;
    use tracing_subscriber::layer::SubscriberExt;

    /// Records the peer context each new span ended up with
    struct FieldRecorder(Arc<Mutex<Vec<(String, Option<String>)>>>);

    impl<S> Layer<S> for FieldRecorder
    where
        S: Subscriber + for<'lookup> LookupSpan<'lookup>,
    {
        fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
            let span = ctx.span(id).unwrap();
            let peer = span
                .extensions()
                .get::<PeerContext>()
                .map(|c| c.peer_id.clone());
            self.0
                .lock()
                .unwrap()
                .push((attrs.metadata().name().to_string(), peer));
        }
    }

    #[test]
    fn test_spans_carry_peer_context() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let subscriber = Registry::default()
            .with(PeerContextLayer::new())
            .with(FieldRecorder(seen.clone()));

        tracing::subscriber::with_default(subscriber, || {
            drop(tracing::info_span!("outside").entered());

            let node = {
                let _guard = PeerContextGuard::new(&SimulationIdentity::new('B').unwrap());
                tracing::info_span!("node")
            };
            let _entered = node.enter();
            let _child = tracing::info_span!("child");
        });

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                ("outside".to_string(), None),
                ("node".to_string(), Some("B".to_string())),
                ("child".to_string(), Some("B".to_string())),
            ]
        );
    }
}
