use crate::{collaborators::TransactionRecord, replies, session::AuthenticatedUser};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub fn format_amount(amount: i64) -> String {
    format!("₹{amount}")
}

pub fn format_transaction(record: &TransactionRecord) -> String {
    format!(
        "Transaction ID: {}\nAmount: {}\nType: {}\nMethod: {}\nDescription: {}\nBalance After: {}\nDate: {}",
        record.id,
        format_amount(record.amount),
        record.kind,
        record.method,
        record.description.as_deref().unwrap_or("-"),
        format_amount(record.balance_after),
        record.timestamp.format(TIMESTAMP_FORMAT),
    )
}

/// One message for the whole listing, records in the order given (newest first)
pub fn format_transactions(records: &[TransactionRecord]) -> String {
    if records.is_empty() {
        return replies::NO_TRANSACTIONS.to_string();
    }
    records
        .iter()
        .map(format_transaction)
        .collect::<Vec<_>>()
        .join("\n\n")
}

pub fn format_balance(latest: Option<&TransactionRecord>) -> String {
    match latest {
        Some(record) => format!(
            "Your current balance is {} (as of {}).",
            format_amount(record.balance_after),
            record.timestamp.format(TIMESTAMP_FORMAT)
        ),
        None => replies::NO_TRANSACTIONS.to_string(),
    }
}

/// Account holder details and recent activity handed to the answer service
pub fn build_query_context(user: &AuthenticatedUser, records: &[TransactionRecord]) -> String {
    let mut context = format!(
        "Customer: {}\nCustomer ID: {}\nAccount Number: {}\nAccount Type: {}\nCity: {}",
        user.name,
        user.customer_id,
        user.account_number,
        user.account_type,
        user.city.as_deref().unwrap_or("unknown"),
    );

    if records.is_empty() {
        context.push_str("\n\nRecent Transactions: none");
    } else {
        context.push_str("\n\nRecent Transactions (newest first):");
        for record in records {
            context.push_str(&format!(
                "\n- {} | {} {} via {} | {} | balance after {}",
                record.timestamp.format(TIMESTAMP_FORMAT),
                record.kind,
                format_amount(record.amount),
                record.method,
                record.description.as_deref().unwrap_or("-"),
                format_amount(record.balance_after),
            ));
        }
    }
    context
}
