//! Paging, fork isolation, and teardown properties

use std::collections::HashSet;
use std::rc::Rc;

use oxidos::compiler::{DATA_BASE, TEXT_BASE};
use oxidos::host::ManualClock;
use oxidos::vm::CtxState;
use oxidos::Machine;

fn machine() -> (Machine, Rc<ManualClock>) {
    let clock = Rc::new(ManualClock::new());
    (Machine::with_clock(Box::new(Rc::clone(&clock))), clock)
}

#[test]
fn test_loaded_segments_translate() {
    let (mut m, _clock) = machine();
    m.write_file("/bin/tiny", b"int g = 99; int main() { return g; }")
        .unwrap();
    let pid = m.exec("/bin/tiny", &[]).unwrap();
    // text and data are mapped and hold what the image says
    let text = m.read_memory(pid, TEXT_BASE, 4).unwrap();
    assert_ne!(text, vec![0, 0, 0, 0]);
    let data = m.read_memory(pid, DATA_BASE, 4).unwrap();
    assert_eq!(u32::from_le_bytes([data[0], data[1], data[2], data[3]]), 99);
    // an address in no segment faults
    assert!(m.read_memory(pid, 0x1000_0000, 4).is_err());
}

#[test]
fn test_fork_copies_frames_by_value() {
    let (mut m, _clock) = machine();
    m.write_file(
        "/bin/splitter",
        b"#include \"io\"\nint g = 7; int main() { int p; p = fork(); sleep(1000000); return p; }",
    )
    .unwrap();
    let parent = m.exec("/bin/splitter", &[]).unwrap();
    m.run(50);
    // both parked in their long sleep
    let child = 2;
    assert_eq!(m.process(parent).unwrap().state, CtxState::Waiting);
    assert_eq!(m.process(child).unwrap().state, CtxState::Waiting);

    // identical contents...
    let ptext = m.read_memory(parent, TEXT_BASE, 256).unwrap();
    let ctext = m.read_memory(child, TEXT_BASE, 256).unwrap();
    assert_eq!(ptext, ctext);
    let pdata = m.read_memory(parent, DATA_BASE, 4).unwrap();
    let cdata = m.read_memory(child, DATA_BASE, 4).unwrap();
    assert_eq!(pdata, cdata);

    // ...on fully disjoint frames
    let pframes: HashSet<_> = m.process(parent).unwrap().frames.iter().copied().collect();
    let cframes: HashSet<_> = m.process(child).unwrap().frames.iter().copied().collect();
    assert!(pframes.is_disjoint(&cframes));
    assert!(!pframes.is_empty());
}

#[test]
fn test_fork_returns_zero_in_child() {
    let (mut m, _clock) = machine();
    m.write_file(
        "/bin/forker",
        b"#include \"io\"\nint main() { int p; p = fork(); if (p == 0) return 42; return wait(); }",
    )
    .unwrap();
    let pid = m.exec("/bin/forker", &[]).unwrap();
    m.run(100);
    // the child saw 0 and exited 42; the parent collected it
    assert_eq!(m.reap(pid), Some(42));
}

#[test]
fn test_zombie_retains_no_frames() {
    let (mut m, _clock) = machine();
    m.write_file("/bin/done", b"int main() { return 0; }").unwrap();
    let pid = m.exec("/bin/done", &[]).unwrap();
    m.run(50);
    let ctx = m.process(pid).unwrap();
    assert_eq!(ctx.state, CtxState::Zombie);
    assert!(ctx.frames.is_empty());
    assert!(ctx.page_table.is_none());
}

#[test]
fn test_teardown_returns_frames_to_pool() {
    let (mut m, _clock) = machine();
    m.write_file("/bin/burner", b"int main() { return 3; }").unwrap();
    let free_before = m.pool().free_count();
    let pid = m.exec("/bin/burner", &[]).unwrap();
    assert!(m.pool().free_count() < free_before);
    m.run(50);
    // frames come back at zombie transition, before the reap
    assert_eq!(m.pool().free_count(), free_before);
    assert_eq!(m.reap(pid), Some(3));
    assert_eq!(m.pool().free_count(), free_before);
}

#[test]
fn test_reaped_slot_is_reusable() {
    let (mut m, _clock) = machine();
    m.write_file("/bin/one", b"int main() { return 1; }").unwrap();
    let pid = m.exec("/bin/one", &[]).unwrap();
    m.run(50);
    assert_eq!(m.reap(pid), Some(1));
    assert!(m.process(pid).is_none());
    // the same slot serves the next process
    let next = m.exec("/bin/one", &[]).unwrap();
    assert_eq!(next, pid);
}

#[test]
fn test_heap_growth_maps_fresh_pages() {
    let (mut m, _clock) = machine();
    m.write_file(
        "/bin/hungry",
        b"#include \"io\"\n\
          int main() {\n\
              char *p;\n\
              int i;\n\
              p = (char*)malloc(10000);\n\
              if (p == 0) return 1;\n\
              for (i = 0; i < 10000; ++i) p[i] = 7;\n\
              return p[9999];\n\
          }",
    )
    .unwrap();
    let free_before = m.pool().free_count();
    let pid = m.exec("/bin/hungry", &[]).unwrap();
    m.run(2000);
    assert_eq!(m.reap(pid), Some(7));
    // every heap frame was recycled at teardown
    assert_eq!(m.pool().free_count(), free_before);
}

#[test]
fn test_sibling_isolation_after_write() {
    // the child mutates its copy of a global; the parent's stays intact
    let (mut m, _clock) = machine();
    m.write_file(
        "/bin/mutator",
        b"#include \"io\"\n\
          int g = 1;\n\
          int main() {\n\
              int p;\n\
              p = fork();\n\
              if (p == 0) { g = 99; return g; }\n\
              wait();\n\
              return g;\n\
          }",
    )
    .unwrap();
    let pid = m.exec("/bin/mutator", &[]).unwrap();
    m.run(200);
    // no shared memory: the parent still sees 1
    assert_eq!(m.reap(pid), Some(1));
}

#[test]
fn test_stack_overflow_faults_cleanly() {
    let (mut m, _clock) = machine();
    m.write_file(
        "/bin/deep",
        b"int rec(int n) { return rec(n + 1); }\nint main() { return rec(0); }",
    )
    .unwrap();
    let free_before = m.pool().free_count();
    let pid = m.exec("/bin/deep", &[]).unwrap();
    m.run(5000);
    assert_eq!(m.reap(pid), Some(-1));
    assert!(m.console().screen_text().contains("Stack overflow"));
    assert_eq!(m.pool().free_count(), free_before);
}
