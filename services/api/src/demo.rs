use crate::infra::DemoPropertyProvider;
use clap::Args;
use propsearch::error::AppError;
use propsearch::search::{
    AccountId, HistoryId, MemoryStore, OrchestratorConfig, SearchError, SearchOrchestrator,
    SearchRequest, SearchResult, SearchType,
};
use std::sync::Arc;

#[derive(Args, Debug)]
pub(crate) struct DemoArgs {
    /// Account used for the walkthrough
    #[arg(long, default_value = "demo-account")]
    pub(crate) account: String,
    /// Credits granted before the first search
    #[arg(long, default_value_t = 2)]
    pub(crate) credits: u32,
    /// Address searched during the walkthrough
    #[arg(long, default_value = "123 Main St, Minneapolis, MN 55401")]
    pub(crate) address: String,
    #[arg(long, default_value_t = 44.9778, allow_hyphen_values = true)]
    pub(crate) latitude: f64,
    #[arg(long, default_value_t = -93.2650, allow_hyphen_values = true)]
    pub(crate) longitude: f64,
}

pub(crate) async fn run_demo(args: DemoArgs) -> Result<(), AppError> {
    let DemoArgs {
        account,
        credits,
        address,
        latitude,
        longitude,
    } = args;

    let orchestrator = SearchOrchestrator::new(
        Arc::new(MemoryStore::new()),
        Arc::new(DemoPropertyProvider),
        OrchestratorConfig::default(),
    );
    let account_id = AccountId(account);
    orchestrator.ledger().open_account(&account_id, credits).await?;

    println!("Property search demo");
    println!("Account {account_id} opened with {credits} credit(s)\n");

    let caller = Some(&account_id);
    let basic_request =
        SearchRequest::new(address.as_str(), SearchType::Basic, latitude, longitude);
    let basic = orchestrator.perform_search(caller, basic_request).await;
    let basic_id = render_step("Basic search", &basic);

    let smart_request =
        SearchRequest::new(address.as_str(), SearchType::Smart, latitude, longitude);
    let smart = orchestrator
        .perform_search(caller, smart_request.clone())
        .await;
    render_step("Smart search", &smart);

    let replay = orchestrator.perform_search(caller, smart_request).await;
    render_step("Same smart search resubmitted", &replay);

    if let Some(history_id) = basic_id {
        let upgraded = orchestrator.upgrade_search(caller, &history_id).await;
        render_step("Upgrade of the basic search", &upgraded);
    }

    let exhausted = orchestrator
        .perform_search(
            caller,
            SearchRequest::new(
                format!("1 {address}"),
                SearchType::Smart,
                latitude,
                longitude,
            ),
        )
        .await;
    render_step("Smart search for another address", &exhausted);

    let audit = orchestrator.ledger().audit(&account_id).await?;
    println!(
        "\nFinal balance: {} available ({} earned, {} spent)",
        audit.balance.available_credits, audit.balance.total_earned, audit.balance.total_spent
    );
    let entries = orchestrator.ledger().transactions(&account_id, 20).await?;
    println!("Ledger entries ({}):", entries.len());
    for entry in entries.iter().rev() {
        println!(
            "  - {:<20} +{} / -{}  {}",
            entry.action_type.as_str(),
            entry.credits_added,
            entry.credits_consumed,
            entry.description
        );
    }
    println!(
        "Audit: {}",
        if audit.is_clean() {
            "balance matches ledger"
        } else {
            "ledger needs reconciliation"
        }
    );

    Ok(())
}

fn render_step(label: &str, outcome: &Result<SearchResult, SearchError>) -> Option<HistoryId> {
    match outcome {
        Ok(result) => {
            let remaining = result
                .remaining_credits
                .map(|credits| format!(", {credits} credit(s) left"))
                .unwrap_or_default();
            println!(
                "{label}: {} search {}{}{}",
                result.search_type,
                result.history_id,
                if result.replayed {
                    " (replayed, not charged)"
                } else {
                    ""
                },
                remaining
            );
            println!("  credits used: {}", result.credits_used);
            Some(result.history_id.clone())
        }
        Err(err) => {
            println!(
                "{label}: refused [{}] {err}{}",
                err.kind(),
                if err.is_retryable() { " (retryable)" } else { "" }
            );
            None
        }
    }
}
