use std::collections::HashMap;

use anyhow::{anyhow, Result};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::{info, warn};
use uuid::Uuid;

use crate::fitness::FitnessEngine;
use crate::ledger::LedgerDb;
use crate::models::{Agent, AgentRole, AgentStatus, RuntimeConfig, StrategyTemplate};

const COHORT_SIZE: usize = 8;
const EXPLORER_COUNT: usize = 2;
/// Top share of the ended cohort eligible as parents.
const PARENT_FRACTION: f64 = 0.5;
const MUTATION_RATE: f64 = 0.3;
/// Relative scale of a mutation step.
const MUTATION_SCALE: f64 = 0.15;
/// Explorers start with wider jitter than bred cores.
const EXPLORER_JITTER: f64 = 0.35;

/// Creates the next cohort from an ended one. Called by the lifecycle
/// manager strictly after generation finalization.
pub trait BreedingCollaborator: Send + Sync {
    fn breed(&self, ended_generation_id: &str, new_generation_id: &str) -> Result<usize>;
}

/// Gene template per strategy: gate thresholds plus sizing and exit knobs.
/// Values are the cohort-neutral baselines that jitter and crossover move.
fn gene_defaults(template: StrategyTemplate) -> Vec<(&'static str, f64)> {
    let mut genes: Vec<(&'static str, f64)> = crate::engine::gates::entry_gates(template)
        .iter()
        .map(|&g| (g, crate::engine::gates::default_threshold(g)))
        .collect();
    genes.push(("position_fraction", 0.1));
    genes.push(("stop_loss_pct", 0.05));
    genes.push(("take_profit_pct", 0.08));
    match template {
        StrategyTemplate::Momentum | StrategyTemplate::Breakout => {
            genes.push(("exit_trend_slope", 0.05));
        }
        StrategyTemplate::MeanReversion => {
            genes.push(("exit_recovery_pct", 1.0));
        }
    }
    genes
}

fn template_for_index(i: usize) -> StrategyTemplate {
    match i % 3 {
        0 => StrategyTemplate::Momentum,
        1 => StrategyTemplate::MeanReversion,
        _ => StrategyTemplate::Breakout,
    }
}

/// Deterministic RNG per breeding run: reruns after a crash produce the same
/// cohort instead of a subtly different one.
fn rng_for_run(ended: &str, new: &str) -> ChaCha8Rng {
    let key = format!("evobot:breed:{}:{}", ended, new);
    let digest = Uuid::new_v5(&Uuid::NAMESPACE_URL, key.as_bytes());
    ChaCha8Rng::seed_from_u64(digest.as_u128() as u64)
}

fn jitter(rng: &mut ChaCha8Rng, value: f64, scale: f64) -> f64 {
    let factor = 1.0 + rng.gen_range(-scale..=scale);
    value * factor
}

/// Uniform crossover of two parents' genes, then per-gene mutation.
fn crossover(
    rng: &mut ChaCha8Rng,
    a: &HashMap<String, f64>,
    b: &HashMap<String, f64>,
    template: StrategyTemplate,
) -> HashMap<String, f64> {
    let mut child = HashMap::new();
    for (key, default) in gene_defaults(template) {
        let from_a = *a.get(key).unwrap_or(&default);
        let from_b = *b.get(key).unwrap_or(&default);
        let mut value = if rng.gen_bool(0.5) { from_a } else { from_b };
        if rng.gen_bool(MUTATION_RATE) {
            value = jitter(rng, value, MUTATION_SCALE);
        }
        child.insert(key.to_string(), value);
    }
    child
}

fn fresh_genes(
    rng: &mut ChaCha8Rng,
    template: StrategyTemplate,
    scale: f64,
) -> HashMap<String, f64> {
    gene_defaults(template)
        .into_iter()
        .map(|(key, default)| (key.to_string(), jitter(rng, default, scale)))
        .collect()
}

pub struct GeneticBreeder {
    db: LedgerDb,
    /// Size of the tradable symbol universe, for the diversity term when
    /// ranking parents.
    symbols_available: usize,
}

impl GeneticBreeder {
    pub fn new(db: LedgerDb, symbols_available: usize) -> Self {
        Self {
            db,
            symbols_available,
        }
    }

    /// First-ever cohort: defaults with mild jitter, no parents involved.
    pub fn seed_initial(&self, generation_id: &str, total_capital: f64, now: i64) -> Result<usize> {
        let mut rng = rng_for_run("genesis", generation_id);
        let agents = self.build_cohort(generation_id, total_capital, now, &mut rng, &[]);
        self.db.insert_agents(&agents)?;
        info!("🌱 Seeded initial cohort: {} agents", agents.len());
        Ok(agents.len())
    }

    fn build_cohort(
        &self,
        generation_id: &str,
        total_capital: f64,
        now: i64,
        rng: &mut ChaCha8Rng,
        parents: &[Agent],
    ) -> Vec<Agent> {
        let allocation = total_capital / COHORT_SIZE as f64;
        let mut agents = Vec::with_capacity(COHORT_SIZE);
        for i in 0..COHORT_SIZE {
            let is_explorer = i >= COHORT_SIZE - EXPLORER_COUNT;
            let template = template_for_index(i);
            let genes = if is_explorer || parents.is_empty() {
                let scale = if is_explorer { EXPLORER_JITTER } else { MUTATION_SCALE };
                fresh_genes(rng, template, scale)
            } else {
                let a = &parents[rng.gen_range(0..parents.len())];
                let b = &parents[rng.gen_range(0..parents.len())];
                crossover(rng, &a.genes, &b.genes, template)
            };
            let role = if is_explorer {
                AgentRole::Explorer
            } else {
                AgentRole::Core
            };
            agents.push(Agent {
                id: Uuid::new_v4().to_string(),
                generation_id: generation_id.to_string(),
                name: format!("{}-{}", template.as_str(), i + 1),
                template,
                genes,
                capital_allocation: allocation,
                role,
                status: AgentStatus::Active,
                created_at: now,
            });
        }
        agents
    }
}

impl BreedingCollaborator for GeneticBreeder {
    fn breed(&self, ended_generation_id: &str, new_generation_id: &str) -> Result<usize> {
        let new_generation = self
            .db
            .get_generation(new_generation_id)?
            .ok_or_else(|| anyhow!("new generation {} not found", new_generation_id))?;

        // A retried handoff must not double the cohort.
        if self.db.count_generation_agents(new_generation_id)? > 0 {
            info!(
                "Generation {} already has agents; breed is a no-op",
                new_generation.number
            );
            return Ok(0);
        }

        let cfg = self.db.load_runtime_config()?;
        let cohort = self.db.list_generation_agents(ended_generation_id)?;
        let total_capital = if cohort.is_empty() {
            10_000.0
        } else {
            cohort.iter().map(|a| a.capital_allocation).sum()
        };
        let ranked = self.rank_parents(&cohort, &cfg)?;
        if ranked.is_empty() {
            warn!(
                "No parents available from generation {}; seeding fresh cohort",
                ended_generation_id
            );
        }

        let now = new_generation.started_at;
        let mut rng = rng_for_run(ended_generation_id, new_generation_id);
        let agents =
            self.build_cohort(new_generation_id, total_capital, now, &mut rng, &ranked);
        self.db.insert_agents(&agents)?;
        info!(
            "🧬 Bred generation {}: {} agents from {} parents",
            new_generation.number,
            agents.len(),
            ranked.len()
        );
        Ok(agents.len())
    }
}

impl GeneticBreeder {
    /// The ended cohort ranked by fitness, truncated to the parent share.
    /// Works off retired agents directly since the ended generation has no
    /// active ones left by hand-off time.
    fn rank_parents(&self, cohort: &[Agent], cfg: &RuntimeConfig) -> Result<Vec<Agent>> {
        if cohort.is_empty() {
            return Ok(Vec::new());
        }

        let engine = FitnessEngine::new(self.db.clone());
        let mut scored: Vec<(f64, &Agent)> = Vec::with_capacity(cohort.len());
        for agent in cohort {
            let report = engine.score_agent(agent, cfg, self.symbols_available.max(1))?;
            scored.push((report.score, agent));
        }
        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.1.id.cmp(&b.1.id))
        });

        let keep = ((cohort.len() as f64 * PARENT_FRACTION).ceil() as usize).max(1);
        Ok(scored
            .into_iter()
            .take(keep)
            .map(|(_, a)| a.clone())
            .collect())
    }
}
