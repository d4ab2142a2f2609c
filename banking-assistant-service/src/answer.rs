use async_trait::async_trait;
use banking_flow::{AnswerService, FlowError, Result, RetryPolicy};
use rig::{agent::Agent, completion::Prompt, prelude::*, providers::openrouter};
use std::time::Duration;
use tracing::{debug, info};

const BANKING_ASSISTANT_PREAMBLE: &str = r#"You are a helpful banking assistant. Answer the customer's question using only the account details and recent transactions provided.
Amounts are in Indian Rupees (₹). Be concise, friendly and accurate.
If the question cannot be answered from the provided data, say so and describe what information you do have.
Never invent transactions, balances or account details."#;

/// Answers customer questions with an OpenRouter-hosted model
pub struct RigAnswerService {
    agent: Agent<openrouter::CompletionModel>,
    timeout: Duration,
    retry: RetryPolicy,
}

impl RigAnswerService {
    pub fn new(api_key: &str, model: &str, timeout: Duration, retry: RetryPolicy) -> Self {
        let client = openrouter::Client::new(api_key);
        let agent = client
            .agent(model)
            .preamble(BANKING_ASSISTANT_PREAMBLE)
            .build();
        info!(model, timeout_secs = timeout.as_secs(), "Answer service ready");
        Self {
            agent,
            timeout,
            retry,
        }
    }
}

fn compose_prompt(question: &str, context: &str) -> String {
    format!("Account information:\n{context}\n\nCustomer question: {question}")
}

#[async_trait]
impl AnswerService for RigAnswerService {
    async fn answer(&self, prompt: &str, context: &str) -> Result<String> {
        let request = compose_prompt(prompt, context);
        let agent = &self.agent;
        let timeout = self.timeout;
        let request = request.as_str();

        let answer = self
            .retry
            .run("answer_question", move || async move {
                match tokio::time::timeout(timeout, agent.prompt(request)).await {
                    Ok(Ok(answer)) => Ok(answer),
                    Ok(Err(e)) => Err(FlowError::UpstreamUnavailable(format!(
                        "model request failed: {e}"
                    ))),
                    Err(_) => Err(FlowError::UpstreamUnavailable(format!(
                        "model did not answer within {}s",
                        timeout.as_secs()
                    ))),
                }
            })
            .await?;

        debug!(answer_len = answer.len(), "Question answered");
        Ok(answer)
    }
}
