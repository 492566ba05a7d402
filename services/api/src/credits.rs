use crate::infra::durable_store;
use clap::Args;
use propsearch::config::AppConfig;
use propsearch::error::AppError;
use propsearch::search::{AccountId, ActionType, CreditLedger, LedgerError, SystemClock};
use std::sync::Arc;

#[derive(Args, Debug)]
pub(crate) struct GrantArgs {
    /// Account receiving the credits
    #[arg(long)]
    pub(crate) account: String,
    /// Number of credits to add
    #[arg(long)]
    pub(crate) credits: u32,
    /// Record the grant as a subscription renewal instead of a purchase
    #[arg(long)]
    pub(crate) renewal: bool,
    /// Ledger description (defaults to the action name)
    #[arg(long)]
    pub(crate) description: Option<String>,
}

#[derive(Args, Debug)]
pub(crate) struct ShowArgs {
    /// Account to inspect
    #[arg(long)]
    pub(crate) account: String,
    /// Number of recent ledger entries to print
    #[arg(long, default_value_t = 10)]
    pub(crate) limit: usize,
}

pub(crate) async fn run_grant(args: GrantArgs) -> Result<(), AppError> {
    let GrantArgs {
        account,
        credits,
        renewal,
        description,
    } = args;

    let config = AppConfig::load()?;
    let ledger = CreditLedger::new(Arc::new(durable_store(&config).await?), Arc::new(SystemClock));
    let account_id = AccountId(account);

    match ledger.get_balance(&account_id).await {
        Ok(_) => {}
        Err(LedgerError::AccountNotFound(_)) => {
            ledger.open_account(&account_id, 0).await?;
            println!("Opened account {account_id}");
        }
        Err(err) => return Err(err.into()),
    }

    let action_type = if renewal {
        ActionType::SubscriptionRenewal
    } else {
        ActionType::Purchase
    };
    let description = description.unwrap_or_else(|| match action_type {
        ActionType::SubscriptionRenewal => "Subscription renewal".to_string(),
        _ => "Credit purchase".to_string(),
    });

    let receipt = ledger
        .credit(&account_id, credits, action_type, &description)
        .await?;
    println!(
        "Granted {credits} credit(s) to {account_id} as {} ({})",
        action_type.as_str(),
        receipt.transaction.id
    );
    println!(
        "Balance: {} available, {} earned, {} spent",
        receipt.balance.available_credits, receipt.balance.total_earned, receipt.balance.total_spent
    );
    Ok(())
}

pub(crate) async fn run_show(args: ShowArgs) -> Result<(), AppError> {
    let config = AppConfig::load()?;
    let ledger = CreditLedger::new(Arc::new(durable_store(&config).await?), Arc::new(SystemClock));
    let account_id = AccountId(args.account);

    let audit = ledger.audit(&account_id).await?;
    let balance = &audit.balance;
    println!("Account {account_id}");
    println!(
        "  available {} | earned {} | spent {} | updated {}",
        balance.available_credits,
        balance.total_earned,
        balance.total_spent,
        balance.last_updated.to_rfc3339()
    );

    let entries = ledger.transactions(&account_id, args.limit).await?;
    if entries.is_empty() {
        println!("  no ledger entries");
    } else {
        println!("  recent entries:");
        for entry in entries {
            let delta = i64::from(entry.credits_added) - i64::from(entry.credits_consumed);
            println!(
                "    {} {:>+4} {:<20} {}",
                entry.created_at.format("%Y-%m-%d %H:%M:%S"),
                delta,
                entry.action_type.as_str(),
                entry.description
            );
        }
    }

    let verdict = if audit.is_clean() {
        "consistent"
    } else {
        "NEEDS RECONCILIATION"
    };
    println!(
        "  audit: {verdict} ({} entries, {} consumed, {} added)",
        audit.entries, audit.logged_consumed, audit.logged_added
    );
    Ok(())
}
