use std::sync::Arc;
use std::time::{Duration, Instant};

use async_stream::stream;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use strand_core::config::ModelConfig;
use strand_core::error::{Result, StrandError};
use strand_core::traits::{LlmClient, ToolInvocation, ToolInvokeMeta, ToolInvoker, ToolOutput};
use strand_core::types::*;

use crate::log;
use crate::prompt;
use crate::result::{AgentChunk, AgentOutput, AgentResult, AgentState, FinishReason};

/// Accumulator for streaming tool call deltas.
#[derive(Debug, Default)]
struct ToolCallAccumulator {
    id: String,
    name: String,
    input_json: String,
}

impl ToolCallAccumulator {
    fn into_call(self) -> ToolCall {
        let arguments = if self.input_json.trim().is_empty() {
            json!({})
        } else {
            serde_json::from_str(&self.input_json).unwrap_or(Value::Null)
        };
        ToolCall {
            id: self.id,
            name: self.name,
            arguments,
        }
    }
}

/// Inputs for one agent run.
#[derive(Debug, Clone)]
pub struct AgentParams {
    pub model: ModelConfig,
    pub instruction: String,
    pub query: String,
    pub image_urls: Vec<String>,
    pub max_iterations: usize,
    pub tool_timeout: Duration,
    /// Tools offered to the model. Empty offers everything the invoker has.
    pub tool_names: Vec<String>,
    /// Node running the loop, forwarded to the invocation hook.
    pub node_id: Option<String>,
}

impl AgentParams {
    pub fn new(model: ModelConfig, query: impl Into<String>) -> Self {
        Self {
            model,
            instruction: String::new(),
            query: query.into(),
            image_urls: vec![],
            max_iterations: 10,
            tool_timeout: Duration::from_secs(30),
            tool_names: vec![],
            node_id: None,
        }
    }
}

/// Bounded think/act/observe loop.
///
/// Each round asks the model for a response, runs any requested tools
/// through the invocation hook, and feeds the observations back. The round
/// budget is enforced by withholding tool definitions in the final round.
pub struct AgentLoop {
    llm: Arc<dyn LlmClient>,
    tools: Arc<dyn ToolInvoker>,
    params: AgentParams,
    cancel: CancellationToken,
}

impl AgentLoop {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        tools: Arc<dyn ToolInvoker>,
        params: AgentParams,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            llm,
            tools,
            params,
            cancel,
        }
    }

    fn tool_definitions(&self) -> Vec<ToolDefinition> {
        let all = self.tools.definitions();
        if self.params.tool_names.is_empty() {
            return all;
        }
        all.into_iter()
            .filter(|d| self.params.tool_names.iter().any(|n| n == &d.name))
            .collect()
    }

    /// Drive the loop. Yields chunks in order, then exactly one `Done`.
    pub fn run(self) -> BoxStream<'static, Result<AgentOutput>> {
        let defs = self.tool_definitions();
        let AgentLoop {
            llm,
            tools,
            params,
            cancel,
        } = self;
        let max_iterations = params.max_iterations.max(1);

        Box::pin(stream! {
            let base = prompt::initial_messages(&params.instruction, &params.query, &params.image_urls);
            let mut history: Vec<ChatMessage> = Vec::new();
            let mut usage = LlmUsage::default();
            let mut files = Vec::new();
            let mut text = String::new();
            let mut round = 0usize;
            let mut finish = FinishReason::Stop;
            let mut round_log: Option<AgentLog> = None;
            let mut round_text = String::new();
            let mut round_usage = LlmUsage::default();
            let mut pending: Vec<ToolCall> = Vec::new();
            let mut call_logs: Vec<AgentLog> = Vec::new();
            let mut state = AgentState::AwaitingModel;

            loop {
                match state {
                    AgentState::AwaitingModel => {
                        if cancel.is_cancelled() {
                            finish = FinishReason::Cancelled;
                            state = AgentState::Done;
                            continue;
                        }
                        round += 1;
                        round_text.clear();
                        round_usage = LlmUsage::default();
                        debug!(round, "Starting agent round");
                        let started = log::round_start(round);
                        round_log = Some(started.clone());
                        yield Ok(AgentOutput::Yield(AgentChunk::Log(started)));
                        state = AgentState::ModelResponding;
                    }

                    AgentState::ModelResponding => {
                        let Some(current_round) = round_log.clone() else {
                            yield Err(StrandError::LlmStream("round log missing".into()));
                            return;
                        };
                        let last_round = round >= max_iterations;
                        let offered: &[ToolDefinition] = if last_round { &[] } else { &defs };
                        let messages = prompt::round_messages(&base, &history, round);
                        let thought = log::thought_start(&current_round.id, &params.model.model_id);
                        yield Ok(AgentOutput::Yield(AgentChunk::Log(thought.clone())));

                        let started = Instant::now();
                        let stream_result = tokio::select! {
                            result = llm.chat_stream(&params.model, messages, offered) => Some(result),
                            _ = cancel.cancelled() => None,
                        };
                        let mut deltas = match stream_result {
                            Some(Ok(s)) => s,
                            Some(Err(e)) => {
                                yield Ok(AgentOutput::Yield(AgentChunk::Log(round_error(&current_round, &e))));
                                yield Err(e);
                                return;
                            }
                            None => {
                                finish = FinishReason::Cancelled;
                                state = AgentState::Done;
                                continue;
                            }
                        };

                        let mut thinking = String::new();
                        let mut calls: Vec<ToolCallAccumulator> = Vec::new();
                        let mut stop_reason = None;
                        let mut stream_err = None;
                        let mut cancelled = false;

                        while let Some(delta) = deltas.next().await {
                            if cancel.is_cancelled() {
                                cancelled = true;
                                break;
                            }
                            match delta {
                                Ok(StreamDelta::TextDelta(t)) => {
                                    round_text.push_str(&t);
                                    text.push_str(&t);
                                    yield Ok(AgentOutput::Yield(AgentChunk::Text(t)));
                                }
                                Ok(StreamDelta::ThinkingDelta(t)) => thinking.push_str(&t),
                                Ok(StreamDelta::ToolUseStart { index, id, name }) => {
                                    while calls.len() <= index {
                                        calls.push(ToolCallAccumulator::default());
                                    }
                                    calls[index].id = id;
                                    calls[index].name = name;
                                }
                                Ok(StreamDelta::ToolInputDelta { index, delta }) => {
                                    if let Some(tc) = calls.get_mut(index) {
                                        tc.input_json.push_str(&delta);
                                    }
                                }
                                Ok(StreamDelta::Stop(reason)) => stop_reason = Some(reason),
                                Ok(StreamDelta::Usage(u)) => round_usage.accumulate(&u),
                                Err(e) => {
                                    stream_err = Some(e);
                                    break;
                                }
                            }
                        }
                        drop(deltas);

                        if let Some(e) = stream_err {
                            yield Ok(AgentOutput::Yield(AgentChunk::Log(round_error(&current_round, &e))));
                            yield Err(e);
                            return;
                        }
                        usage.accumulate(&round_usage);

                        let tool_calls: Vec<ToolCall> = calls
                            .into_iter()
                            .filter(|c| !c.name.is_empty())
                            .map(ToolCallAccumulator::into_call)
                            .collect();

                        let mut content = Vec::new();
                        if !thinking.is_empty() {
                            content.push(ContentBlock::Thinking { thinking: thinking.clone() });
                        }
                        if !round_text.is_empty() {
                            content.push(ContentBlock::Text { text: round_text.clone() });
                        }
                        for call in &tool_calls {
                            content.push(ContentBlock::ToolUse {
                                id: call.id.clone(),
                                name: call.name.clone(),
                                input: call.arguments.clone(),
                            });
                        }
                        history.push(ChatMessage { role: Role::Assistant, content });

                        let mut meta = usage_metadata(&round_usage);
                        meta.insert("elapsed_ms".into(), json!(started.elapsed().as_millis() as u64));
                        yield Ok(AgentOutput::Yield(AgentChunk::Log(log::finish(
                            &thought,
                            AgentLogStatus::Success,
                            json!({"output": round_text, "thought": thinking}),
                            meta,
                        ))));

                        if cancelled {
                            finish = FinishReason::Cancelled;
                            state = AgentState::Done;
                        } else if tool_calls.is_empty() {
                            finish = match stop_reason {
                                Some(StopReason::MaxTokens) => FinishReason::Length,
                                _ => FinishReason::Stop,
                            };
                            yield Ok(AgentOutput::Yield(AgentChunk::Log(round_success(
                                &current_round, &round_text, &[], &round_usage,
                            ))));
                            state = AgentState::Done;
                        } else if last_round {
                            warn!(round, max_iterations, "Agent round budget exhausted with pending tool calls");
                            finish = FinishReason::IterationLimit;
                            yield Ok(AgentOutput::Yield(AgentChunk::Log(round_success(
                                &current_round, &round_text, &[], &round_usage,
                            ))));
                            state = AgentState::Done;
                        } else {
                            pending = tool_calls;
                            state = AgentState::AwaitingTool;
                        }
                    }

                    AgentState::AwaitingTool => {
                        let round_id = round_log.as_ref().map(|l| l.id.clone()).unwrap_or_default();
                        call_logs = pending
                            .iter()
                            .map(|call| log::tool_call_start(&round_id, call))
                            .collect();
                        // all starts first, so consumers see the whole batch before results
                        for started in &call_logs {
                            yield Ok(AgentOutput::Yield(AgentChunk::Log(started.clone())));
                        }
                        state = AgentState::ToolResponding;
                    }

                    AgentState::ToolResponding => {
                        let calls = std::mem::take(&mut pending);
                        let futs = calls.iter().map(|call| {
                            invoke_tool(&*tools, call, params.tool_timeout, params.node_id.clone())
                        });
                        let outputs = futures::future::join_all(futs).await;

                        let mut responses = Vec::with_capacity(outputs.len());
                        for ((call, output), started) in calls.iter().zip(outputs).zip(call_logs.drain(..)) {
                            let is_error = output.meta.error.is_some();
                            let observation = match &output.meta.error {
                                Some(err) => format!("tool invoke error: {err}"),
                                None => output.content.clone(),
                            };
                            files.extend(output.files.iter().cloned());
                            history.push(ChatMessage::tool_result(&call.id, &observation, is_error));

                            let mut meta = Map::new();
                            meta.insert("elapsed_ms".into(), json!(output.meta.elapsed_ms));
                            meta.insert("error".into(), json!(output.meta.error));
                            yield Ok(AgentOutput::Yield(AgentChunk::Log(log::finish(
                                &started,
                                AgentLogStatus::Success,
                                json!({
                                    "tool_call_id": call.id,
                                    "tool_call_name": call.name,
                                    "tool_call_args": call.arguments,
                                    "output": observation,
                                }),
                                meta,
                            ))));
                            responses.push(json!({"tool_call_name": call.name, "output": observation}));
                        }

                        if let Some(current_round) = round_log.as_ref() {
                            yield Ok(AgentOutput::Yield(AgentChunk::Log(round_success(
                                current_round, &round_text, &responses, &round_usage,
                            ))));
                        }
                        state = AgentState::AwaitingModel;
                    }

                    AgentState::Done => {
                        info!(
                            rounds = round,
                            finish_reason = finish.as_str(),
                            total_tokens = usage.total_tokens,
                            "Agent loop finished"
                        );
                        yield Ok(AgentOutput::Done(AgentResult {
                            text: std::mem::take(&mut text),
                            files: std::mem::take(&mut files),
                            usage,
                            finish_reason: finish,
                            rounds: round,
                        }));
                        break;
                    }
                }
            }
        })
    }

    /// Run to completion, collecting every chunk.
    pub async fn run_to_end(self) -> Result<(Vec<AgentChunk>, AgentResult)> {
        let mut stream = self.run();
        let mut chunks = Vec::new();
        while let Some(item) = stream.next().await {
            match item? {
                AgentOutput::Yield(chunk) => chunks.push(chunk),
                AgentOutput::Done(result) => return Ok((chunks, result)),
            }
        }
        Err(StrandError::LlmStream("agent loop ended without a result".into()))
    }
}

/// Invoke one tool. Provider failures become observations, never loop errors.
async fn invoke_tool(
    tools: &dyn ToolInvoker,
    call: &ToolCall,
    timeout: Duration,
    node_id: Option<String>,
) -> ToolOutput {
    let started = Instant::now();
    let invocation = ToolInvocation {
        call_id: call.id.clone(),
        tool_name: call.name.clone(),
        arguments: call.arguments.clone(),
        node_id,
    };
    match tokio::time::timeout(timeout, tools.invoke(invocation)).await {
        Ok(Ok(mut output)) => {
            if output.meta.elapsed_ms == 0 {
                output.meta.elapsed_ms = started.elapsed().as_millis() as u64;
            }
            output
        }
        Ok(Err(e)) => {
            warn!(tool = %call.name, error = %e, "Tool execution failed");
            ToolOutput {
                meta: ToolInvokeMeta::error(started.elapsed(), e.to_string()),
                ..Default::default()
            }
        }
        Err(_) => {
            let e = StrandError::ToolTimeout {
                tool: call.name.clone(),
                timeout_secs: timeout.as_secs(),
            };
            warn!(tool = %call.name, "Tool execution timed out");
            ToolOutput {
                meta: ToolInvokeMeta::error(started.elapsed(), e.to_string()),
                ..Default::default()
            }
        }
    }
}

fn usage_metadata(usage: &LlmUsage) -> Map<String, Value> {
    let mut meta = Map::new();
    meta.insert("prompt_tokens".into(), json!(usage.prompt_tokens));
    meta.insert("completion_tokens".into(), json!(usage.completion_tokens));
    meta.insert("total_tokens".into(), json!(usage.total_tokens));
    meta
}

fn round_success(
    round: &AgentLog,
    llm_response: &str,
    tool_responses: &[Value],
    usage: &LlmUsage,
) -> AgentLog {
    log::finish(
        round,
        AgentLogStatus::Success,
        json!({"output": {"llm_response": llm_response, "tool_responses": tool_responses}}),
        usage_metadata(usage),
    )
}

fn round_error(round: &AgentLog, error: &StrandError) -> AgentLog {
    log::finish(
        round,
        AgentLogStatus::Error,
        json!({"error": error.to_string()}),
        Map::new(),
    )
}
