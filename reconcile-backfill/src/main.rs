use std::time::Duration;

use axum::Router;
use envconfig::Envconfig;
use eyre::Result;
use futures::future::{select, Either};
use tokio::sync::Semaphore;
use tracing::{error, info};

use reconcile::backfill::{BackfillJob, BackfillScope, BackfillSource};
use reconcile::health::{HealthHandle, HealthRegistry};
use reconcile::identity::business_offset;
use reconcile::ingest::Recorder;
use reconcile::store::postgres::MIGRATOR;
use reconcile::store::{PostgresStore, TransactionStore};

use config::Config;
use source::PgBackfillSource;

mod config;
mod handlers;
mod metrics;
mod source;

async fn listen(app: Router, bind: String) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, app).await?;

    Ok(())
}

async fn run_pass<S: TransactionStore, Src: BackfillSource>(
    job: &BackfillJob<'_, S, Src>,
    scope: &BackfillScope,
) {
    match job.run(scope).await {
        Ok(report) => {
            if !report.is_clean() {
                for failure in &report.failures {
                    error!(
                        record = %failure.record,
                        reason = %failure.reason,
                        "backfill skipped a record"
                    );
                }
            }
            info!(
                shares = report.shares_replayed,
                engagements = report.engagements_replayed,
                failures = report.failures.len(),
                "backfill pass complete"
            );
        }
        Err(e) => error!("backfill pass failed: {}", e),
    }
}

async fn backfill_loop<S: TransactionStore, Src: BackfillSource>(
    job: BackfillJob<'_, S, Src>,
    scope: BackfillScope,
    interval_secs: u64,
    liveness: HealthHandle,
) {
    let semaphore = Semaphore::new(1);
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));

    loop {
        let _permit = semaphore.acquire().await;
        interval.tick().await;
        run_pass(&job, &scope).await;
        liveness.report_healthy().await;
        drop(_permit);
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("failed to load configuration from env");

    let store = PostgresStore::new(&config.database_url).expect("failed to create store");
    MIGRATOR
        .run(store.pool())
        .await
        .expect("failed to run migrations");

    let recorder = Recorder::new(store);
    let source = PgBackfillSource::new(config.legacy_url()).expect("failed to create source");
    let scope = BackfillScope {
        brand_campaign_id: config.brand_campaign_id.clone(),
    };
    let offset = business_offset(config.business_utc_offset_minutes);
    let job = BackfillJob::new(&recorder, &source, offset);

    if config.run_once {
        run_pass(&job, &scope).await;
        return;
    }

    let liveness = HealthRegistry::new("liveness");
    let handle = liveness
        .register(
            "backfill".to_owned(),
            // A couple of missed passes before the probe goes red.
            chrono::Duration::seconds((config.backfill_interval_secs * 3) as i64),
        )
        .await;

    let loop_fut = Box::pin(backfill_loop(
        job,
        scope,
        config.backfill_interval_secs,
        handle,
    ));

    let recorder_handle = metrics::setup_metrics_recorder();
    let app = handlers::app(liveness, Some(recorder_handle));
    let http_server = Box::pin(listen(app, config.bind()));

    match select(http_server, loop_fut).await {
        Either::Left((listen_result, _)) => match listen_result {
            Ok(_) => {}
            Err(e) => error!("failed to start backfill http server, {}", e),
        },
        Either::Right((_, _)) => {
            error!("backfill loop exited")
        }
    };
}
