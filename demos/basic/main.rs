//! Basic example using the in-memory broker.
//!
//! This example demonstrates:
//! - Scheduling the three reference job kinds through a JobScheduler
//! - Running one worker pool per queue, each on its own connection
//! - A handler that fails once and is retried with backoff
//! - Graceful shutdown on Ctrl+C
//!
//! Run with: `cargo run -p demo-basic`

use courier_core::{
    shutdown_signal, Job, JobError, JobResult, JobScheduler, MemoryBroker, RetryPolicy,
    SchedulerConfig, WorkerPool,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Email notification payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct EmailJob {
    to: String,
    subject: String,
}

/// Monthly report payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ReportJob {
    account: String,
    month: String,
}

/// Thumbnail payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ImageJob {
    path: String,
    width: u32,
}

async fn send_email(job: Job) -> JobResult {
    let email: EmailJob = serde_json::from_value(job.data).map_err(JobError::from)?;
    println!("[email] sending to {}: {}", email.to, email.subject);
    tokio::time::sleep(Duration::from_millis(300)).await;
    Ok(json!({"delivered": true}))
}

async fn generate_report(job: Job) -> JobResult {
    let report: ReportJob = serde_json::from_value(job.data).map_err(JobError::from)?;
    println!("[reports] building {} for {}", report.month, report.account);
    tokio::time::sleep(Duration::from_millis(800)).await;
    Ok(json!({"pages": 12}))
}

#[tokio::main]
async fn main() -> courier_core::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_target(false)
        .init();

    println!("courier job dispatch example\n");

    let broker = MemoryBroker::new();
    let scheduler = JobScheduler::new(broker.clone(), SchedulerConfig::default());
    scheduler.init().await?;

    let emails = vec![
        EmailJob {
            to: "alice@example.com".to_string(),
            subject: "Welcome!".to_string(),
        },
        EmailJob {
            to: "bob@example.com".to_string(),
            subject: "Your order shipped".to_string(),
        },
    ];
    for email in emails {
        let job_id = scheduler.schedule("emails", email).await?;
        println!("  scheduled email: {}", job_id);
    }

    let job_id = scheduler
        .schedule(
            "reports",
            ReportJob {
                account: "acme".to_string(),
                month: "2024-05".to_string(),
            },
        )
        .await?;
    println!("  scheduled report: {}", job_id);

    let job_id = scheduler
        .schedule(
            "imageProcessing",
            ImageJob {
                path: "uploads/cat.png".to_string(),
                width: 320,
            },
        )
        .await?;
    println!("  scheduled image: {}", job_id);

    // The image handler fails on its first attempt to show a retry.
    let image_calls = Arc::new(AtomicU32::new(0));
    let image_pool = {
        let image_calls = image_calls.clone();
        WorkerPool::builder()
            .gateway(broker.connect())
            .queue("image_processing")
            .concurrency(2)
            .retry(RetryPolicy {
                base_delay: Duration::from_millis(250),
                ..RetryPolicy::default()
            })
            .handler(move |job: Job| {
                let image_calls = image_calls.clone();
                async move {
                    let image: ImageJob =
                        serde_json::from_value(job.data).map_err(JobError::from)?;
                    if image_calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        println!("[images] {} failed on attempt {}", image.path, job.attempt);
                        return Err(JobError::new("image store not ready"));
                    }
                    println!("[images] resized {} to {}px", image.path, image.width);
                    Ok(json!({"thumbnail": format!("{}.thumb", image.path)}))
                }
            })
            .build()?
    };

    let email_pool = WorkerPool::builder()
        .gateway(broker.connect())
        .queue("email_sending")
        .concurrency(2)
        .handler(send_email)
        .build()?;

    let report_pool = WorkerPool::builder()
        .gateway(broker.connect())
        .queue("reports_generation")
        .concurrency(1)
        .drain_timeout(Duration::from_secs(5))
        .handler(generate_report)
        .build()?;

    println!("\nStarting worker pools...");
    println!("Press Ctrl+C to stop\n");

    let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
    let mut handles = Vec::new();
    for pool in [email_pool, report_pool, image_pool] {
        let mut stop = stop_rx.clone();
        handles.push(tokio::spawn(async move {
            let outcome = pool
                .run_until(async move {
                    let _ = stop.wait_for(|stop| *stop).await;
                })
                .await;
            (pool.config().queue.clone(), pool.stats(), outcome)
        }));
    }

    shutdown_signal().await;
    let _ = stop_tx.send(true);

    for handle in handles {
        match handle.await {
            Ok((queue, stats, outcome)) => {
                println!("{}: {:?} {:?}", queue, outcome?, stats);
            }
            Err(e) => tracing::error!(error = %e, "Worker pool task failed"),
        }
    }

    scheduler.close().await?;
    Ok(())
}
