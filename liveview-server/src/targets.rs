//! Built-in render targets and services.
//!
//! These are the collaborators that bridge dispatcher output to broker
//! frames. They stay thin on the server side: the heavy rendering (markdown,
//! syntax highlighting) happens in the browser; a target only decides which
//! frames carry the content over.

use std::sync::Arc;

use liveview_core::{EventType, HandlerRegistry};
use tracing::warn;

use crate::broker::EventBroker;

/// Register the built-in handlers against a registry.
///
/// External renderers use the same two calls (`register_target`,
/// `register_service`) to plug in without the core knowing them.
pub fn register_builtin_handlers(registry: &mut HandlerRegistry, broker: &Arc<EventBroker>) {
    let b = Arc::clone(broker);
    registry.register_target("Html", move |_id, content| {
        b.dispatch_to_viewers(EventType::Write, content);
    });

    let b = Arc::clone(broker);
    registry.register_target("JavaScript", move |_id, content| {
        b.dispatch_to_viewers(EventType::Script, content);
    });

    let b = Arc::clone(broker);
    registry.register_target("JavaScriptCall", move |_id, content| {
        b.dispatch_to_viewers(EventType::Call, content);
    });

    let b = Arc::clone(broker);
    registry.register_target("Css", move |_id, content| {
        b.dispatch_to_viewers(EventType::Css, content);
    });

    let b = Arc::clone(broker);
    registry.register_target("Clear", move |_id, _content| {
        b.dispatch_to_viewers(EventType::Clear, "");
    });

    // Markdown ships the raw text inside a preformatted script element so it
    // reaches the browser uninterpreted, then a call renders it in place.
    // Reusing an id replaces the element from an earlier command.
    let b = Arc::clone(broker);
    registry.register_target("Markdown", move |id, content| {
        b.dispatch_to_viewers(
            EventType::Write,
            &format!("<script id='{id}' type='preformatted'>{content}</script>"),
        );
        b.dispatch_to_viewers(EventType::Call, &markdown_render_call(id));
    });

    // Text: identity transform that falls back to the content last recorded
    // under its id, so a pipe can recall earlier output.
    registry.register_service("Text", |id, content, memory| {
        if content.trim().is_empty() {
            memory.get(id).cloned()
        } else {
            Some(content.to_string())
        }
    });

    // Codeblock: 'lang;code' into a fenced markdown block.
    registry.register_service("Codeblock", |_id, content, _memory| {
        match content.split_once(';') {
            Some((lang, code)) => Some(format!("```{}\n{}\n```", lang.trim(), code.trim())),
            None => {
                warn!("invalid codeblock format, expected 'lang;code'");
                None
            }
        }
    });
}

fn markdown_render_call(id: &str) -> String {
    format!(
        "var scriptElement = document.getElementById('{id}');\n\
         var divElement = document.createElement('div');\n\
         divElement.id = scriptElement.id;\n\
         divElement.innerHTML = window.md.render(scriptElement.textContent);\n\
         scriptElement.parentNode.replaceChild(divElement, scriptElement);"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use liveview_core::{Command, Dispatcher, Instruction};

    fn setup() -> (Dispatcher, Arc<EventBroker>) {
        let broker = Arc::new(EventBroker::new(50001));
        let mut registry = HandlerRegistry::new();
        register_builtin_handlers(&mut registry, &broker);
        (Dispatcher::new(Arc::new(registry)), broker)
    }

    fn decode_frame(frame: &str) -> (String, String) {
        let (kind, payload) = frame.split_once(':').unwrap();
        (
            kind.to_string(),
            String::from_utf8(STANDARD.decode(payload).unwrap()).unwrap(),
        )
    }

    fn command(name: &str, id: &str, content: &str) -> Instruction {
        Instruction::Command(Command {
            name: name.to_string(),
            id: id.to_string(),
            content: content.to_string(),
        })
    }

    #[tokio::test]
    async fn markdown_writes_preformatted_content_then_renders() {
        let (dispatcher, broker) = setup();
        let (_id, mut rx) = broker.subscribe_viewer();
        let mut run = dispatcher.begin_run();

        dispatcher.execute(&mut run, command("Markdown", "m1", "# Title")).await;

        let (kind, data) = decode_frame(&rx.try_recv().unwrap());
        assert_eq!(kind, "WRITE");
        assert!(data.contains("id='m1'"));
        assert!(data.contains("# Title"));

        let (kind, data) = decode_frame(&rx.try_recv().unwrap());
        assert_eq!(kind, "CALL");
        assert!(data.contains("getElementById('m1')"));
    }

    #[tokio::test]
    async fn clear_sends_an_empty_clear_frame() {
        let (dispatcher, broker) = setup();
        let (_id, mut rx) = broker.subscribe_viewer();
        let mut run = dispatcher.begin_run();

        dispatcher.execute(&mut run, command("Clear", "x", "ignored")).await;

        let (kind, data) = decode_frame(&rx.try_recv().unwrap());
        assert_eq!(kind, "CLEAR");
        assert_eq!(data, "");
    }

    #[tokio::test]
    async fn codeblock_produces_a_fenced_block() {
        let (dispatcher, _broker) = setup();
        let mut run = dispatcher.begin_run();

        dispatcher
            .execute(&mut run, command("Codeblock", "c1", "rust; fn main() {}"))
            .await;

        assert_eq!(run.recall("c1"), Some("```rust\nfn main() {}\n```"));
    }

    #[tokio::test]
    async fn text_recalls_previous_content_in_a_pipe() {
        let (dispatcher, broker) = setup();
        let (_id, mut rx) = broker.subscribe_viewer();
        let mut run = dispatcher.begin_run();

        dispatcher.execute(&mut run, command("Text", "t1", "remembered")).await;
        dispatcher
            .execute(
                &mut run,
                Instruction::Pipe(liveview_core::Pipe {
                    refs: vec![
                        liveview_core::CommandRef {
                            name: "Text".to_string(),
                            id: "t1".to_string(),
                        },
                        liveview_core::CommandRef {
                            name: "Html".to_string(),
                            id: "h1".to_string(),
                        },
                    ],
                }),
            )
            .await;

        let (kind, data) = decode_frame(&rx.try_recv().unwrap());
        assert_eq!(kind, "WRITE");
        assert_eq!(data, "remembered");
    }
}
