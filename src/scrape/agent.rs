//! Scrape Agent
//!
//! Runs one independent scraper task per target and waits for all of them.

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};

use super::scheduler::{ScrapeExit, ScrapeTarget, Scraper};
use crate::error::Result;
use crate::transport::RetryPolicy;

/// A set of scrape targets polled concurrently
#[derive(Debug)]
pub struct Agent {
    scrapers: Vec<Scraper>,
}

impl Agent {
    /// Create an agent; fails if any target cannot be bound to a client
    pub fn new(targets: Vec<ScrapeTarget>, policy: RetryPolicy) -> Result<Self> {
        let scrapers = targets
            .into_iter()
            .map(|target| Scraper::new(target, policy))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { scrapers })
    }

    pub fn len(&self) -> usize {
        self.scrapers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scrapers.is_empty()
    }

    /// Run every scraper until `cancel` fires or all sinks are gone.
    ///
    /// Each scraper owns its sink sender, so when this returns every sink
    /// has been dropped and its receiver observes end of data.
    #[instrument(skip(self, cancel), fields(targets = self.scrapers.len()))]
    pub async fn run(self, cancel: CancellationToken) {
        let mut tasks = JoinSet::new();

        for scraper in self.scrapers {
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let host = scraper.target().host().to_string();
                let exit = scraper.run(cancel).await;
                (host, exit)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((host, ScrapeExit::Cancelled)) => info!("Scraper for {} cancelled", host),
                Ok((host, ScrapeExit::SinkClosed)) => info!("Scraper for {} lost its sink", host),
                Err(e) => error!("Scraper task failed: {}", e),
            }
        }

        info!("All scrapers stopped");
    }
}
