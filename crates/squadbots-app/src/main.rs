//! Headless arena runner: two scripted squads play out episodes against
//! the walls of a rectangular arena, demonstrating the full per-bot
//! tick loop (sense, act, step, lifecycle) without a renderer.

use anyhow::Result;
use squadbots_core::{
    Animation, BotId, EngineConfig, Position, RayHit, SimulationHost, SquadEngine, Team,
    FLAG_BUCKETS, OBSTACLE_BEARINGS,
};
use std::collections::HashMap;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

/// Minimal scene backend: bots are points, the arena boundary is the
/// only obstacle, and time is a manually advanced clock.
struct ArenaHost {
    width: f64,
    height: f64,
    positions: HashMap<BotId, Position>,
    rotations: HashMap<BotId, f64>,
    spawn_requests: Vec<Position>,
    clock: f64,
}

impl ArenaHost {
    fn new(width: f64, height: f64) -> Self {
        Self {
            width,
            height,
            positions: HashMap::new(),
            rotations: HashMap::new(),
            spawn_requests: Vec::new(),
            clock: 0.0,
        }
    }

    fn place(&mut self, id: BotId, position: Position) {
        self.positions.insert(id, position);
    }

    fn tick(&mut self, seconds: f64) {
        self.clock += seconds;
    }

    fn walls(&self) -> [(Position, Position); 4] {
        let (w, h) = (self.width, self.height);
        [
            (Position::new(0.0, 0.0), Position::new(w, 0.0)),
            (Position::new(w, 0.0), Position::new(w, h)),
            (Position::new(w, h), Position::new(0.0, h)),
            (Position::new(0.0, h), Position::new(0.0, 0.0)),
        ]
    }
}

/// Parametric segment intersection: the fraction along `a1 -> a2` at
/// which it crosses `b1 -> b2`, if it does.
fn segment_fraction(a1: Position, a2: Position, b1: Position, b2: Position) -> Option<f64> {
    let r = (a2.x - a1.x, a2.y - a1.y);
    let s = (b2.x - b1.x, b2.y - b1.y);
    let denom = r.0 * s.1 - r.1 * s.0;
    if denom == 0.0 {
        return None;
    }
    let q = (b1.x - a1.x, b1.y - a1.y);
    let t = (q.0 * s.1 - q.1 * s.0) / denom;
    let u = (q.0 * r.1 - q.1 * r.0) / denom;
    if (0.0..=1.0).contains(&t) && (0.0..=1.0).contains(&u) {
        Some(t)
    } else {
        None
    }
}

impl SimulationHost for ArenaHost {
    fn position(&self, id: BotId) -> Position {
        self.positions.get(&id).copied().unwrap_or_default()
    }

    fn set_position(&mut self, id: BotId, position: Position) {
        self.positions.insert(id, position);
    }

    fn set_rotation(&mut self, id: BotId, heading: f64) {
        self.rotations.insert(id, heading);
    }

    fn cast_ray(&self, from: Position, to: Position) -> Option<RayHit> {
        let nearest = self
            .walls()
            .iter()
            .filter_map(|&(b1, b2)| segment_fraction(from, to, b1, b2))
            .fold(None::<f64>, |best, t| match best {
                Some(current) if current <= t => Some(current),
                _ => Some(t),
            })?;
        Some(RayHit {
            entity: None,
            point: Position::new(
                from.x + (to.x - from.x) * nearest,
                from.y + (to.y - from.y) * nearest,
            ),
        })
    }

    fn set_animation(&mut self, _id: BotId, _animation: Animation) {}

    fn now(&self) -> f64 {
        self.clock
    }

    fn request_spawn(&mut self, position: Position) {
        self.spawn_requests.push(position);
    }
}

/// Scripted policy: steer toward whichever flag-compass bucket is lit,
/// throttling forward speed by how open the center ray reads.
fn flag_seeking_action(observations: &[f64]) -> [f64; 2] {
    let compass = &observations[OBSTACLE_BEARINGS.len()..];
    let bearing = compass
        .iter()
        .position(|reading| *reading > 0.0)
        .map(|slot| {
            let (lo, hi) = FLAG_BUCKETS[slot];
            (lo + hi) / 2.0
        })
        .unwrap_or(0.0);
    let turn = (bearing.to_radians() * 0.5).clamp(-0.2, 0.2);
    let center_ray = observations[OBSTACLE_BEARINGS.len() / 2];
    let speed = if center_ray > 0.5 { 0.8 } else { 0.1 };
    [speed, turn]
}

fn main() -> Result<()> {
    init_tracing();

    let mut config = EngineConfig {
        arena_width: 256.0,
        arena_height: 256.0,
        flag: Position::new(128.0, 200.0),
        spawn_staging: Position::new(128.0, 85.0),
        pending_spawns: 2,
        rng_seed: Some(0x5EED),
        ..EngineConfig::default()
    };
    let mut engine = SquadEngine::new(&config)?;
    let mut host = ArenaHost::new(config.arena_width, config.arena_height);
    let mut next_id = 0u64;
    let mut roster: Vec<BotId> = Vec::new();

    let spawn = |engine: &mut SquadEngine,
                 host: &mut ArenaHost,
                 roster: &mut Vec<BotId>,
                 next_id: &mut u64,
                 team: Team,
                 position: Position| {
        let id = BotId(*next_id);
        *next_id += 1;
        engine.enroll(id, team);
        host.place(id, position);
        roster.push(id);
        id
    };

    for lane in 0..3 {
        let x = 64.0 + 64.0 * f64::from(lane);
        spawn(&mut engine, &mut host, &mut roster, &mut next_id, Team::Blue, Position::new(x, 40.0));
        spawn(&mut engine, &mut host, &mut roster, &mut next_id, Team::Red, Position::new(x, 216.0));
    }
    info!(bots = roster.len(), "arena populated");

    let episodes = 3;
    for episode in 0..episodes {
        loop {
            host.tick(config.step_delay + 0.01);
            let ids: Vec<BotId> = roster.clone();
            let mut finished = 0usize;
            for id in &ids {
                if engine.is_episode_over(*id, &config) {
                    finished += 1;
                    continue;
                }
                if !engine.is_active(*id, &mut host, &config) {
                    continue;
                }
                let observations = engine.sense(*id, &host, &config);
                let action = flag_seeking_action(&observations);
                let peers: Vec<BotId> =
                    ids.iter().copied().filter(|peer| peer != id).collect();
                let score = engine.step(*id, &action, &mut host, &config, &peers)?;
                if score != 0.0 {
                    debug!(bot = id.0, score, "terminal tick");
                }
            }

            // Reinforcements requested by the spawn hook join the blue
            // squad at the staged positions.
            for position in host.spawn_requests.drain(..).collect::<Vec<_>>() {
                let id = BotId(next_id);
                next_id += 1;
                engine.enroll(id, Team::Blue);
                host.place(id, position);
                roster.push(id);
                config.pending_spawns = config.pending_spawns.saturating_sub(1);
                info!(bot = id.0, x = position.x, y = position.y, "reinforcement arrived");
            }

            if finished == ids.len() {
                break;
            }
        }

        for id in &roster {
            if let Some(state) = engine.agent_state(*id) {
                info!(
                    episode,
                    bot = id.0,
                    team = ?state.team,
                    final_fitness = state.final_fitness,
                    damage = state.total_damage,
                    "episode complete"
                );
            }
            engine.reset_agent(*id, &mut host)?;
        }
    }

    info!("run finished");
    Ok(())
}
