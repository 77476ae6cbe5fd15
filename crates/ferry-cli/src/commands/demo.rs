//! `ferry demo`: end-to-end scenarios against the reference backends.
//!
//! Every scenario gets a fresh session, so counters and object tables
//! start empty.

use super::Session;
use crate::output::StyledOutput;
use anyhow::ensure;
use ferry_abi::thunk::{decode_guest, encode_guest};
use ferry_abi::{GuestAddr, GuestHandle, GuestSlice, HResult, Thunk};
use ferry_runtime::{Bridge, BridgeConfig};
use ferry_user::canvas::ReferenceCanvas;
use ferry_user::trampoline_calls;
use ferry_user::types::{Point, Rect, TextRun, TextRunGuest, DSS_DISABLED, DST_COMPLEX};
use ferry_user::UserApiStubs;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use termcolor::ColorChoice;

type Scenario = fn(&Session) -> anyhow::Result<()>;

const SCENARIOS: &[(&str, Scenario)] = &[
    ("rectangle helpers", rectangles),
    ("nested pointer array", text_runs),
    ("window text truncation", window_text),
    ("draw_state reentrancy", reentrancy),
    ("null callback", null_callback),
    ("proxy identity across roles", proxy_identity),
    ("reference counting", reference_counting),
    ("layer enumeration", layers),
];

const FENCE: u64 = 0xFE11_FE11_FE11_FE11;

pub fn execute(config: &BridgeConfig, choice: ColorChoice) -> anyhow::Result<()> {
    let mut out = StyledOutput::new(choice);
    let mut failed = 0;
    for (name, scenario) in SCENARIOS {
        let result = Session::open(config).and_then(|session| scenario(&session));
        match result {
            Ok(()) => {
                out.pass_badge();
                out.plain(&format!(" {}\n", name));
            }
            Err(err) => {
                failed += 1;
                out.fail_badge();
                out.plain(&format!(" {}: ", name));
                out.error(&format!("{:#}", err));
                out.newline();
            }
        }
    }
    out.newline();
    if failed == 0 {
        out.success(&format!("{} scenarios passed", SCENARIOS.len()));
        out.newline();
        out.flush();
        Ok(())
    } else {
        out.flush();
        anyhow::bail!("{} of {} scenarios failed", failed, SCENARIOS.len())
    }
}

fn rectangles(session: &Session) -> anyhow::Result<()> {
    let user = session.user();
    let memory = session.bridge.memory();
    let a = memory.alloc_value(&Rect::new(0, 0, 10, 10))?;
    let b = memory.alloc_value(&Rect::new(5, 5, 20, 20))?;
    let dest = memory.alloc_value(&Rect::default())?;

    ensure!(user.intersect_rect(dest, a, b).is_true(), "intersect_rect failed");
    ensure!(memory.read::<Rect>(dest)? == Rect::new(5, 5, 10, 10));
    ensure!(user.union_rect(dest, a, b).is_true(), "union_rect failed");
    ensure!(user.offset_rect(dest, 1, -1).is_true(), "offset_rect failed");
    ensure!(memory.read::<Rect>(dest)? == Rect::new(1, -1, 21, 19));
    ensure!(
        !user.copy_rect(dest, GuestAddr::NULL).is_true(),
        "copy from a null rect succeeded"
    );
    ensure!(memory.read::<Rect>(dest)? == Rect::new(1, -1, 21, 19));
    Ok(())
}

/// Runs fenced by sentinels on both sides; returns each run's address.
fn place_runs(
    bridge: &Bridge,
    texts: &[&str],
) -> anyhow::Result<Vec<(GuestAddr, TextRunGuest)>> {
    let memory = bridge.memory();
    let bits = bridge.context().bits();
    let mut runs = Vec::with_capacity(texts.len());
    for (index, text) in texts.iter().enumerate() {
        let run = TextRunGuest {
            text: memory.alloc_wide(text)?,
            len: text.encode_utf16().count() as u32,
            bounds: Rect::new(4 * index as i32, 0, 0, 0),
            format: 0,
        };
        let mut block = FENCE.to_le_bytes().to_vec();
        block.extend(encode_guest::<TextRun>(&run, bits)?);
        block.extend(FENCE.to_le_bytes());
        let base = memory.alloc_bytes(&block, 8)?;
        runs.push((GuestAddr(base.raw() + 8), run));
    }
    Ok(runs)
}

fn text_runs(session: &Session) -> anyhow::Result<()> {
    let bridge = &session.bridge;
    let memory = bridge.memory();
    let bits = bridge.context().bits();
    let word = bits.word_size();
    let size = TextRun::layout(bits).size;

    let runs = place_runs(bridge, &["one", "two\nlines", "three"])?;
    let pointers: Vec<u8> = runs
        .iter()
        .flat_map(|(addr, _)| addr.raw().to_le_bytes()[..word].to_vec())
        .collect();
    let array = memory.alloc_bytes(&pointers, word)?;

    let measured = session
        .user()
        .measure_text_runs(GuestHandle(1), GuestSlice::new(array, runs.len()));
    ensure!(measured == 3, "measured {} runs, expected 3", measured);

    for (addr, before) in &runs {
        let block = memory.read_bytes(GuestAddr(addr.raw() - 8), size + 16)?;
        ensure!(block[..8] == FENCE.to_le_bytes(), "leading fence overwritten");
        ensure!(block[size + 8..] == FENCE.to_le_bytes(), "trailing fence overwritten");
        let after = decode_guest::<TextRun>(&block[8..size + 8], bits)?;
        ensure!(after.text == before.text, "text pointer changed");
        ensure!(!after.bounds.is_empty(), "bounds not written back");
    }
    ensure!(memory.read_bytes(array, pointers.len())? == pointers);
    Ok(())
}

fn window_text(session: &Session) -> anyhow::Result<()> {
    let window = session.native.create_window("Hello, world");
    let memory = session.bridge.memory();
    let buffer = memory.alloc_slice(&[0xAAAAu16; 6])?;

    let copied = session
        .user()
        .get_window_text(GuestHandle(window.raw()), GuestSlice::new(buffer, 5));
    ensure!(copied == 4, "copied {} units, expected 4", copied);
    let units = memory.read_slice::<u16>(buffer, 6)?;
    ensure!(String::from_utf16(&units[..4])? == "Hell");
    ensure!(units[4] == 0, "missing terminator");
    ensure!(units[5] == 0xAAAA, "wrote past the capacity");
    Ok(())
}

fn reentrancy(session: &Session) -> anyhow::Result<()> {
    let guest = session.bridge.guest();
    let order = Arc::new(Mutex::new(Vec::new()));
    let weak: Weak<Bridge> = Arc::downgrade(&session.bridge);

    let inner = {
        let order = Arc::clone(&order);
        guest.define(move |_| {
            order.lock().push('B');
            1
        })
    };
    let outer = {
        let order = Arc::clone(&order);
        guest.define(move |_| {
            let first = {
                let mut order = order.lock();
                order.push('A');
                order.len() == 1
            };
            match weak.upgrade() {
                Some(bridge) if first => {
                    let nested = UserApiStubs::new(bridge).draw_state(
                        GuestHandle(2),
                        GuestHandle(0),
                        inner,
                        0,
                        0,
                        0,
                        0,
                        4,
                        4,
                        DST_COMPLEX,
                    );
                    u64::from(nested.is_true())
                }
                _ => 1,
            }
        })
    };

    let before = trampoline_calls();
    let ok = session.user().draw_state(
        GuestHandle(1),
        GuestHandle(0),
        outer,
        0,
        0,
        0,
        0,
        8,
        8,
        DST_COMPLEX | DSS_DISABLED,
    );
    ensure!(ok.is_true(), "outer draw_state failed");
    let order: String = order.lock().iter().collect();
    ensure!(order == "ABA", "callbacks ran as {}", order);
    ensure!(trampoline_calls() - before == 3, "trampoline count mismatch");
    Ok(())
}

fn null_callback(session: &Session) -> anyhow::Result<()> {
    let before = trampoline_calls();
    let ok = session.user().draw_state(
        GuestHandle(1),
        GuestHandle(0),
        GuestAddr::NULL,
        0,
        0,
        0,
        0,
        8,
        8,
        DST_COMPLEX,
    );
    ensure!(!ok.is_true(), "draw_state without a callback succeeded");
    ensure!(trampoline_calls() == before, "trampoline ran");
    ensure!(session.bridge.guest().invocations() == 0, "guest code ran");
    Ok(())
}

fn proxy_identity(session: &Session) -> anyhow::Result<()> {
    let canvases = session.canvases();
    let canvas = canvases.create(64, 64).map_err(hresult)?;
    ensure!(canvas.set_marker(12, 34) == HResult::S_OK);

    let legacy = canvas.query_legacy().map_err(hresult)?;
    ensure!(legacy.proxy().same_object(canvas.proxy()), "roles disagree on the object");
    ensure!(legacy.marker().map_err(hresult)? == Point::new(12, 34));

    let host = session
        .bridge
        .objects()
        .get::<ReferenceCanvas>(canvas.handle())
        .ok_or_else(|| anyhow::anyhow!("canvas missing from the object table"))?;
    ensure!(host.marker() == Point::new(12, 34), "host marker differs");
    Ok(())
}

fn reference_counting(session: &Session) -> anyhow::Result<()> {
    let canvases = session.canvases();
    let canvas = canvases.create(8, 8).map_err(hresult)?;
    let copies: Vec<_> = (0..4).map(|_| canvas.clone()).collect();
    let legacy = canvas.query_legacy().map_err(hresult)?;
    ensure!(canvas.proxy().refs() == 6, "refs {} != 6", canvas.proxy().refs());

    drop(copies);
    drop(canvas);
    ensure!(session.canvas.dropped() == 0, "destroyed while referenced");
    drop(legacy);
    ensure!(session.canvas.dropped() == 1, "destroyed {} times", session.canvas.dropped());
    ensure!(canvases.proxies().live() == 0, "anchor survived");
    ensure!(session.bridge.objects().is_empty(), "object table not empty");
    Ok(())
}

fn layers(session: &Session) -> anyhow::Result<()> {
    let canvases = session.canvases();
    let canvas = canvases.create(8, 8).map_err(hresult)?;
    for name in ["background", "sketch"] {
        ensure!(canvas.add_layer(name) == HResult::S_OK);
    }

    let seen = Arc::new(Mutex::new(Vec::new()));
    let routine = {
        let seen = Arc::clone(&seen);
        session.bridge.guest().define(move |frame| {
            let name = frame.memory().read_wide(frame.addr(0)).unwrap_or_default();
            seen.lock().push(name);
            1
        })
    };
    ensure!(canvas.enum_layers(routine, 0) == HResult::S_OK);
    ensure!(*seen.lock() == ["background", "sketch"], "saw {:?}", seen.lock());
    Ok(())
}

fn hresult(status: HResult) -> anyhow::Error {
    anyhow::anyhow!("call failed with {:?}", status)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scenarios_pass_on_default_config() {
        let config = BridgeConfig::default();
        for (name, scenario) in SCENARIOS {
            let session = Session::open(&config).unwrap();
            if let Err(err) = scenario(&session) {
                panic!("{}: {:#}", name, err);
            }
        }
    }
}
