//! Fixed texts sent back to the chat.

pub const WELCOME: &str =
    "Welcome to your banking assistant! Please enter your account number to log in.";
pub const ENTER_ACCOUNT_NUMBER: &str = "Please enter your account number.";
pub const ACCOUNT_FOUND: &str = "Account found. Please enter your password.";
pub const ENTER_PASSWORD: &str = "Please enter your password.";
pub const INVALID_ACCOUNT: &str =
    "Invalid account number. Please check it and try again.";
pub const INVALID_PASSWORD: &str = "Invalid password. Send /start to try again.";
pub const SESSION_EXPIRED: &str = "Your session has expired. Send /start to log in again.";
pub const AUTHENTICATE_FIRST: &str = "Please authenticate first. Send /start to log in.";
pub const NO_TRANSACTIONS: &str = "No transactions found.";
pub const QUERY_USAGE: &str = "Usage: /query <your question>";
pub const EMPTY_ANSWER: &str = "I could not find an answer to that. Please rephrase your question.";
pub const LOGGED_OUT: &str = "You have been logged out. Send /start to log in again.";
pub const TEMPORARILY_UNAVAILABLE: &str =
    "The service is temporarily unavailable. Please try again in a moment.";
pub const GENERIC_ERROR: &str =
    "Something went wrong while handling your message. Please try again.";
pub const CONCURRENT_UPDATE: &str =
    "Another message from this chat was being handled at the same time. Please try again.";

pub const HELP: &str = "Available commands:
/balance - show your current balance
/transactions - list your recent transactions
/query <question> - ask anything about your account
/logout - end your session
/start - log in again";

pub fn logged_in(name: &str) -> String {
    format!("Login successful. Welcome, {name}!\n\n{HELP}")
}
