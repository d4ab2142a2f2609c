use banking_flow::AuthenticatedUser;
use serde::{Deserialize, Serialize};

/// Incoming Telegram update. Only the fields the assistant reads are modelled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramUpdate {
    pub update_id: i64,
    pub message: Option<TelegramMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramMessage {
    pub message_id: i64,
    pub chat: TelegramChat,
    pub text: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramChat {
    pub id: i64,
}

#[derive(Debug, Serialize)]
pub struct SendMessageRequest<'a> {
    pub chat_id: &'a str,
    pub text: &'a str,
}

/// Envelope of every Bot API response
#[derive(Debug, Deserialize)]
pub struct TelegramApiResponse {
    pub ok: bool,
    pub description: Option<String>,
    pub parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
pub struct ResponseParameters {
    pub retry_after: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatRequest {
    pub chat_id: String,
    pub text: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatResponse {
    pub chat_id: String,
    pub reply: String,
    pub state: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionResponse {
    pub chat_id: String,
    pub state: String,
    pub authenticated: Option<AuthenticatedUser>,
}
