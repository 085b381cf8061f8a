//! The sampler-chain front end of the trace engine.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use futures_executor::block_on;

use super::builder::TraceBuilder;
use super::candidate::{DispatcherCategory, TraceCandidate};
use super::config::TraceConfig;
use super::sampler::{
    KeyTransactionPolicy, ScoredEvictionSampler, TransactionSampler, TransactionThresholdPolicy,
};
use super::segment::TransactionTrace;
use super::single_shot::SingleShotSampler;
use super::synthetics::SyntheticsSampler;
use crate::error::{EngineError, EngineResult};
use crate::export::{ExportError, NoopTraceExporter, TraceExporter};

/// Owns the sampler chain and drives harvest-and-export.
///
/// Finished transactions are offered to the synthetics sampler first, then
/// to every registered special sampler, then to the named sampler the
/// candidate routes to. The first acceptance stops the chain. A periodic
/// harvest collects every retained trace and hands the batch to the
/// configured exporter.
#[derive(Debug)]
pub struct TransactionTraceService {
    config: TraceConfig,
    synthetics: Arc<SyntheticsSampler>,
    specials: RwLock<Vec<Arc<dyn TransactionSampler>>>,
    named: RwLock<HashMap<String, Arc<dyn TransactionSampler>>>,
    exporter: Mutex<Box<dyn TraceExporter>>,
    is_shutdown: AtomicBool,
}

impl TransactionTraceService {
    /// Returns a builder with the default configuration and a no-op
    /// exporter.
    pub fn builder() -> TransactionTraceServiceBuilder {
        TransactionTraceServiceBuilder::default()
    }

    fn trace_builder(&self) -> TraceBuilder {
        TraceBuilder::new(self.config.max_stack_trace_frames)
    }

    fn new_scored_sampler(&self) -> Arc<dyn TransactionSampler> {
        Arc::new(ScoredEvictionSampler::new(
            TransactionThresholdPolicy,
            self.config.top_n_capacity,
            self.config.clear_after_empty_harvests,
            self.trace_builder(),
        ))
    }

    /// Offers a finished transaction to the sampler chain. Candidates
    /// finished with tracing disabled are discarded unseen.
    pub fn on_transaction_finished(&self, candidate: TraceCandidate) {
        if self.is_shutdown.load(Ordering::Relaxed) || !candidate.thresholds.enabled {
            return;
        }
        let candidate = Arc::new(candidate);
        if self.synthetics.notice(&candidate) {
            return;
        }
        if let Ok(specials) = self.specials.read() {
            for sampler in specials.iter() {
                if sampler.notice(&candidate) {
                    return;
                }
            }
        }
        if let Some(sampler) = self.named_sampler_for(&candidate) {
            sampler.notice(&candidate);
        }
    }

    fn named_sampler_for(&self, candidate: &TraceCandidate) -> Option<Arc<dyn TransactionSampler>> {
        let name = self.routing_name(candidate);
        if let Ok(named) = self.named.read() {
            if let Some(sampler) = named.get(name) {
                return Some(Arc::clone(sampler));
            }
        }
        // Unknown application under auto app naming: create its sampler.
        let mut named = self.named.write().ok()?;
        Some(Arc::clone(
            named
                .entry(name.to_owned())
                .or_insert_with(|| self.new_scored_sampler()),
        ))
    }

    fn routing_name<'a>(&self, candidate: &'a TraceCandidate) -> &'a str {
        if self.config.auto_app_naming {
            &candidate.app_name
        } else {
            candidate.category.sampler_name()
        }
    }

    /// Adds a sampler ahead of the named samplers in the chain.
    pub fn register_sampler(&self, sampler: Arc<dyn TransactionSampler>) {
        if let Ok(mut specials) = self.specials.write() {
            specials.push(sampler);
        }
    }

    /// Removes a previously registered sampler, stopping it.
    pub fn remove_sampler(&self, sampler: &Arc<dyn TransactionSampler>) {
        if let Ok(mut specials) = self.specials.write() {
            specials.retain(|existing| {
                if Arc::ptr_eq(existing, sampler) {
                    existing.stop();
                    false
                } else {
                    true
                }
            });
        }
    }

    /// Harvests every sampler for the named application and exports the
    /// collected traces. Spent samplers are dropped from the chain.
    pub fn harvest(&self, app_name: &str) -> EngineResult {
        if self.is_shutdown.load(Ordering::Relaxed) {
            return Err(EngineError::AlreadyShutdown);
        }
        let mut traces = self.synthetics.harvest(app_name);
        // Harvest from a snapshot so the notice path is never blocked on
        // the specials lock while traces are built.
        let special_samplers: Vec<Arc<dyn TransactionSampler>> = self
            .specials
            .read()
            .map_err(EngineError::from)?
            .iter()
            .map(Arc::clone)
            .collect();
        for sampler in &special_samplers {
            traces.extend(sampler.harvest(app_name));
        }
        if special_samplers.iter().any(|sampler| sampler.is_exhausted()) {
            if let Ok(mut specials) = self.specials.write() {
                specials.retain(|sampler| {
                    if sampler.is_exhausted() {
                        apm_debug!(name: "TransactionTraceService.SamplerExhausted");
                        false
                    } else {
                        true
                    }
                });
            }
        }
        let named = self.named.read().map_err(EngineError::from)?;
        if self.config.auto_app_naming {
            if let Some(sampler) = named.get(app_name) {
                traces.extend(sampler.harvest(app_name));
            }
        } else {
            for category in [DispatcherCategory::Web, DispatcherCategory::Background] {
                if let Some(sampler) = named.get(category.sampler_name()) {
                    traces.extend(sampler.harvest(app_name));
                }
            }
        }
        drop(named);

        apm_info!(
            name: "TransactionTraceService.Harvest",
            app_name = app_name.to_owned(),
            trace_count = traces.len() as u64
        );
        if traces.is_empty() {
            return Ok(());
        }
        self.export(traces)
    }

    fn export(&self, traces: Vec<TransactionTrace>) -> EngineResult {
        let mut exporter = self.exporter.lock().map_err(EngineError::from)?;
        match block_on(exporter.export(traces)) {
            Ok(()) => Ok(()),
            // The transport asked for this batch to vanish without a sound.
            Err(ExportError::IgnoreSilently) => Ok(()),
            Err(error) => {
                apm_error!(
                    name: "TransactionTraceService.ExportFailed",
                    error = error.to_string()
                );
                Err(EngineError::InternalFailure(error.to_string()))
            }
        }
    }

    /// Stops every sampler, discards retained state and shuts the exporter
    /// down. Further harvests fail with [`EngineError::AlreadyShutdown`].
    pub fn shutdown(&self) -> EngineResult {
        if self
            .is_shutdown
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(EngineError::AlreadyShutdown);
        }
        self.synthetics.stop();
        if let Ok(mut specials) = self.specials.write() {
            for sampler in specials.drain(..) {
                sampler.stop();
            }
        }
        if let Ok(mut named) = self.named.write() {
            for sampler in named.values() {
                sampler.stop();
            }
            named.clear();
        }
        let mut exporter = self.exporter.lock().map_err(EngineError::from)?;
        exporter.shutdown();
        Ok(())
    }
}

/// Builder for [`TransactionTraceService`].
pub struct TransactionTraceServiceBuilder {
    config: TraceConfig,
    exporter: Box<dyn TraceExporter>,
    key_transaction_targets: HashMap<String, Option<Duration>>,
}

impl Default for TransactionTraceServiceBuilder {
    fn default() -> Self {
        TransactionTraceServiceBuilder {
            config: TraceConfig::default(),
            exporter: Box::new(NoopTraceExporter),
            key_transaction_targets: HashMap::new(),
        }
    }
}

impl TransactionTraceServiceBuilder {
    /// Sets the exporter harvested batches are handed to.
    pub fn with_exporter<E: TraceExporter + 'static>(mut self, exporter: E) -> Self {
        self.exporter = Box::new(exporter);
        self
    }

    /// Sets the engine configuration.
    pub fn with_config(mut self, config: TraceConfig) -> Self {
        self.config = config;
        self
    }

    /// Restricts an extra sampler to the given key transactions and their
    /// thresholds.
    pub fn with_key_transaction_targets(
        mut self,
        targets: HashMap<String, Option<Duration>>,
    ) -> Self {
        self.key_transaction_targets = targets;
        self
    }

    /// Builds the service and its initial sampler chain.
    pub fn build(self) -> TransactionTraceService {
        let builder = TraceBuilder::new(self.config.max_stack_trace_frames);
        let service = TransactionTraceService {
            config: self.config,
            synthetics: Arc::new(SyntheticsSampler::new(
                self.config.synthetics_pending_limit,
                builder.clone(),
            )),
            specials: RwLock::new(Vec::new()),
            named: RwLock::new(HashMap::new()),
            exporter: Mutex::new(self.exporter),
            is_shutdown: AtomicBool::new(false),
        };

        if !self.key_transaction_targets.is_empty() {
            service.register_sampler(Arc::new(ScoredEvictionSampler::new(
                KeyTransactionPolicy::new(self.key_transaction_targets),
                self.config.top_n_capacity,
                self.config.clear_after_empty_harvests,
                builder.clone(),
            )));
        }
        if self.config.random_capture_limit > 0 {
            service.register_sampler(Arc::new(SingleShotSampler::new(
                self.config.random_capture_limit,
                builder.clone(),
            )));
        }

        if !self.config.auto_app_naming {
            if let Ok(mut named) = service.named.write() {
                for category in [DispatcherCategory::Web, DispatcherCategory::Background] {
                    named.insert(
                        category.sampler_name().to_owned(),
                        Arc::new(ScoredEvictionSampler::new(
                            TransactionThresholdPolicy,
                            self.config.top_n_capacity,
                            self.config.clear_after_empty_harvests,
                            builder.clone(),
                        )),
                    );
                }
            }
        }
        service
    }
}

impl std::fmt::Debug for TransactionTraceServiceBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionTraceServiceBuilder")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
