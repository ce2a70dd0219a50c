//! Walks one money request through the engine: optimistic write, then the
//! server's answer. Configure with `IOU_*` variables or a `.env` file.
use std::sync::Arc;

use serde_json::json;
use tracing::info;

use iou_engine::config::EngineConfig;
use iou_engine::logging::init_tracing;
use iou_engine::network::{Outcome, QueuedNetwork, RecordingNavigator};
use iou_engine::onyx::OnyxKey;
use iou_engine::request::{MoneyRequestInput, RequestDetails};
use iou_engine::types::Participant;
use iou_engine::{EngineContext, IouService};

fn main() -> anyhow::Result<()> {
    let config = EngineConfig::from_env()?;
    init_tracing(Some(&config.log_level))?;

    let ctx = EngineContext::from_config(config.clone())?;
    ctx.store.set(
        &OnyxKey::Session,
        Some(json!({"accountID": 1, "email": "payee@example.com"})),
    )?;

    let ctx = Arc::new(ctx);
    let network = Arc::new(QueuedNetwork::new(ctx.store.clone()));
    let navigator = Arc::new(RecordingNavigator::default());
    let service = IouService::new(ctx.clone(), network.clone(), navigator.clone());

    let details = RequestDetails {
        merchant: "Lunch".to_string(),
        created: ctx.clock.now().to_date_string(),
        ..RequestDetails::new(2_500, &config.default_currency)
    };
    let input = MoneyRequestInput::new(Participant::person(2, "payer@example.com"), details);
    let Some(info) = service.request_money(input)? else {
        info!("nothing to send");
        return Ok(());
    };
    info!(
        iou_report_id = %info.iou_report.report_id,
        total = info.iou_report.total(),
        pending = network.len(),
        "request applied optimistically"
    );

    network.respond_all(Outcome::Success)?;
    let report = ctx.report(&info.iou_report.report_id)?;
    info!(?report, navigations = ?navigator.events(), "server confirmed the request");
    Ok(())
}
