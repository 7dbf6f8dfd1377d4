//! SSE streaming path for chat completions.
//!
//! The handler subscribes to the run-event bus before dispatching the
//! engine, forwards assistant deltas as OpenAI chunk frames, and terminates
//! with exactly one `data: [DONE]`. A client disconnect stops writes but not
//! the underlying run; usage is still recorded when it resolves.

use super::chat_completions_handler::report_run_usage;
use super::*;
use std::convert::Infallible;

#[derive(Debug)]
enum SseFrame {
    Chunk(Value),
    Done,
}

impl SseFrame {
    fn into_event(self) -> Event {
        match self {
            Self::Chunk(payload) => Event::default().data(payload.to_string()),
            Self::Done => Event::default().data("[DONE]"),
        }
    }
}

pub(super) fn stream_chat_completions(
    state: Arc<GatewayServerState>,
    run_request: AgentRunRequest,
    response_model: String,
    tenant: Option<TenantContext>,
) -> Response {
    let (frame_tx, frame_rx) = mpsc::unbounded_channel::<SseFrame>();
    tokio::spawn(forward_run_events(
        state,
        run_request,
        response_model,
        tenant,
        frame_tx,
    ));

    let stream = UnboundedReceiverStream::new(frame_rx)
        .map(|frame| Ok::<Event, Infallible>(frame.into_event()));
    Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
}

async fn forward_run_events(
    state: Arc<GatewayServerState>,
    run_request: AgentRunRequest,
    response_model: String,
    tenant: Option<TenantContext>,
    frame_tx: mpsc::UnboundedSender<SseFrame>,
) {
    let run_id = run_request.run_id.clone();
    let created_unix = current_unix_timestamp();
    // Subscribe before dispatch so the first delta cannot be missed.
    let mut subscription = state.event_bus.subscribe(&run_id);
    let engine = Arc::clone(&state.engine);
    let mut engine_task = tokio::spawn(async move { engine.run_agent(run_request).await });

    let mut emitter = ChunkEmitter {
        frame_tx,
        run_id: run_id.clone(),
        created_unix,
        response_model,
        saw_delta: false,
        closed: false,
    };

    let completion = loop {
        tokio::select! {
            event = subscription.receiver.recv() => match event {
                Some(event) => {
                    let terminal = event.is_terminal();
                    emitter.emit_event(&event);
                    if terminal {
                        break await_engine_completion(&mut engine_task).await;
                    }
                }
                // The bus handle went away; fall back to the engine result.
                None => break await_engine_completion(&mut engine_task).await,
            },
            result = &mut engine_task => {
                // Engine resolved before (or without) a terminal event; drain
                // whatever was already published, then settle.
                while let Ok(event) = subscription.receiver.try_recv() {
                    emitter.emit_event(&event);
                }
                break flatten_engine_result(result);
            }
        }
    };
    state
        .event_bus
        .unsubscribe(&run_id, subscription.subscriber_id);

    match completion {
        Ok(completion) => {
            if !emitter.saw_delta {
                // No streamed deltas: synthesize one role+content pair from
                // the final payloads.
                let content = joined_payload_text(&completion.payload_texts);
                emitter.emit_role_chunk();
                emitter.emit_content_chunk(&content);
            }
            report_run_usage(&state, tenant.as_ref(), &emitter.response_model, &completion);
        }
        Err(error) => {
            warn!(run_id, "agent engine failed mid-stream: {error}");
            if !emitter.saw_delta {
                emitter.emit_role_chunk();
            }
            emitter.emit_content_chunk(STREAM_INTERNAL_ERROR_TEXT);
            // Other subscribers still need a terminal event for this run.
            state.event_bus.publish(AgentEvent::lifecycle_error(
                run_id.as_str(),
                "agent engine failure",
            ));
        }
    }
    emitter.emit_done();
}

async fn await_engine_completion(
    engine_task: &mut tokio::task::JoinHandle<
        Result<AgentRunCompletion, hanzo_events::AgentEngineError>,
    >,
) -> Result<AgentRunCompletion, hanzo_events::AgentEngineError> {
    flatten_engine_result(engine_task.await)
}

fn flatten_engine_result(
    result: Result<
        Result<AgentRunCompletion, hanzo_events::AgentEngineError>,
        tokio::task::JoinError,
    >,
) -> Result<AgentRunCompletion, hanzo_events::AgentEngineError> {
    match result {
        Ok(result) => result,
        Err(join_error) => Err(hanzo_events::AgentEngineError::Failure(format!(
            "engine task aborted: {join_error}"
        ))),
    }
}

struct ChunkEmitter {
    frame_tx: mpsc::UnboundedSender<SseFrame>,
    run_id: String,
    created_unix: u64,
    response_model: String,
    saw_delta: bool,
    closed: bool,
}

impl ChunkEmitter {
    fn emit_event(&mut self, event: &AgentEvent) {
        if let AgentEventBody::AssistantDelta { text } = &event.body {
            if !self.saw_delta {
                self.emit_role_chunk();
            }
            self.saw_delta = true;
            self.emit_content_chunk(text);
        }
    }

    fn emit_role_chunk(&mut self) {
        let chunk = build_role_chunk(&self.run_id, self.created_unix, &self.response_model);
        self.send(SseFrame::Chunk(chunk));
    }

    fn emit_content_chunk(&mut self, text: &str) {
        let chunk =
            build_content_chunk(&self.run_id, self.created_unix, &self.response_model, text);
        self.send(SseFrame::Chunk(chunk));
    }

    fn emit_done(&mut self) {
        self.send(SseFrame::Done);
    }

    /// A failed send means the client went away; suppress further writes
    /// while the run itself keeps going.
    fn send(&mut self, frame: SseFrame) {
        if self.closed {
            return;
        }
        if self.frame_tx.send(frame).is_err() {
            self.closed = true;
        }
    }
}
