//! `ferry stress`: concurrent calls with randomized scalars.
//!
//! Each worker checks every result against the reference backend called
//! directly, so any marshaling slip shows up as a mismatch.

use super::Session;
use crate::output::StyledOutput;
use ferry_runtime::BridgeConfig;
use ferry_user::types::{Point, Rect};
use ferry_user::NativeUser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use termcolor::ColorChoice;

#[derive(Default)]
struct Tally {
    calls: AtomicU64,
    mismatches: AtomicU64,
    canvases: AtomicU64,
}

impl Tally {
    fn check(&self, ok: bool, what: &str) {
        if !ok {
            self.mismatches.fetch_add(1, Ordering::Relaxed);
            log::error!("mismatch in {}", what);
        }
    }
}

fn random_rect(rng: &mut StdRng) -> Rect {
    let left = rng.gen_range(-500..500);
    let top = rng.gen_range(-500..500);
    Rect::new(
        left,
        top,
        left + rng.gen_range(0..300),
        top + rng.gen_range(0..300),
    )
}

fn worker(session: &Session, seed: u64, calls: u64, tally: &Tally) -> anyhow::Result<()> {
    let mut rng = StdRng::seed_from_u64(seed);
    let user = session.user();
    let canvases = session.canvases();
    let native = &session.native;
    let memory = session.bridge.memory();
    let rect = memory.alloc_value(&Rect::default())?;
    let other = memory.alloc_value(&Rect::default())?;

    for _ in 0..calls {
        match rng.gen_range(0..5) {
            0 => {
                let want = random_rect(&mut rng);
                user.set_rect(rect, want.left, want.top, want.right, want.bottom);
                tally.check(memory.read::<Rect>(rect)? == want, "set_rect");
            }
            1 => {
                let (dx, dy) = (rng.gen_range(-100..100), rng.gen_range(-100..100));
                let mut want = memory.read::<Rect>(rect)?;
                native.offset_rect(Some(&mut want), dx, dy);
                user.offset_rect(rect, dx, dy);
                tally.check(memory.read::<Rect>(rect)? == want, "offset_rect");
            }
            2 => {
                let (a, b) = (random_rect(&mut rng), random_rect(&mut rng));
                memory.write(rect, &a)?;
                memory.write(other, &b)?;
                let mut want = a;
                let ok = native.intersect_rect(Some(&mut want), Some(&a), Some(&b));
                let got = user.intersect_rect(rect, rect, other).is_true();
                tally.check(got == ok, "intersect_rect status");
                tally.check(memory.read::<Rect>(rect)? == want, "intersect_rect");
            }
            3 => {
                let c = rng.gen_range(0..0x250);
                tally.check(user.to_upper(c) == native.to_upper(c), "to_upper");
            }
            _ => {
                let (w, h) = (rng.gen_range(1..64), rng.gen_range(1..64));
                match canvases.create(w, h) {
                    Ok(canvas) => {
                        tally.canvases.fetch_add(1, Ordering::Relaxed);
                        let at = Point::new(
                            rng.gen_range(0..w as i32),
                            rng.gen_range(0..h as i32),
                        );
                        canvas.set_marker(at.x, at.y);
                        tally.check(canvas.marker().ok() == Some(at), "canvas marker");
                    }
                    Err(status) => tally.check(false, &format!("create_canvas: {}", status)),
                }
            }
        }
        tally.calls.fetch_add(1, Ordering::Relaxed);
    }
    Ok(())
}

pub fn execute(
    config: &BridgeConfig,
    threads: usize,
    calls: u64,
    seed: Option<u64>,
    choice: ColorChoice,
) -> anyhow::Result<()> {
    let session = Session::open(config)?;
    let seed = seed.unwrap_or_else(rand::random);
    log::info!(
        "stress: {} threads x {} calls, seed {}",
        threads,
        calls,
        seed
    );

    let tally = Tally::default();
    let started = Instant::now();
    std::thread::scope(|scope| -> anyhow::Result<()> {
        let workers: Vec<_> = (0..threads)
            .map(|index| {
                let (session, tally) = (&session, &tally);
                scope.spawn(move || worker(session, seed.wrapping_add(index as u64), calls, tally))
            })
            .collect();
        for handle in workers {
            handle
                .join()
                .map_err(|_| anyhow::anyhow!("stress worker panicked"))??;
        }
        Ok(())
    })?;
    let elapsed = started.elapsed();

    let created = tally.canvases.load(Ordering::Relaxed);
    tally.check(session.canvas.dropped() == created, "canvas lifetimes");
    tally.check(session.bridge.objects().is_empty(), "leaked objects");

    let mut out = StyledOutput::new(choice);
    let total = tally.calls.load(Ordering::Relaxed);
    out.field("Operations", total);
    out.field("Bridge calls", session.bridge.calls());
    out.field("Canvases", created);
    out.field(
        "Elapsed",
        format!(
            "{:.2?} ({:.0} ops/s)",
            elapsed,
            total as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
        ),
    );
    out.field("Seed", seed);

    let mismatches = tally.mismatches.load(Ordering::Relaxed);
    if mismatches > 0 {
        out.flush();
        anyhow::bail!("{} mismatches", mismatches);
    }
    out.success("no mismatches");
    out.newline();
    out.flush();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workers_agree_with_backend() {
        let session = Session::open(&BridgeConfig::default()).unwrap();
        let tally = Tally::default();
        std::thread::scope(|scope| {
            for index in 0..4 {
                let (session, tally) = (&session, &tally);
                scope.spawn(move || worker(session, 7 + index, 300, tally).unwrap());
            }
        });
        assert_eq!(tally.calls.load(Ordering::Relaxed), 1200);
        assert_eq!(tally.mismatches.load(Ordering::Relaxed), 0);
        assert_eq!(
            session.canvas.dropped(),
            tally.canvases.load(Ordering::Relaxed)
        );
        assert!(session.bridge.objects().is_empty());
    }
}
