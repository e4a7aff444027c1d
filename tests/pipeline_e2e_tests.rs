//! End-to-end pipeline tests
//!
//! Each test writes guest source into the virtual file system, runs it
//! through link → compile → load → execute, and asserts on exit codes
//! and console output.

use std::rc::Rc;

use oxidos::host::ManualClock;
use oxidos::vm::CtxState;
use oxidos::{Error, Machine};

fn machine() -> (Machine, Rc<ManualClock>) {
    let clock = Rc::new(ManualClock::new());
    (Machine::with_clock(Box::new(Rc::clone(&clock))), clock)
}

/// Runs a program to completion and returns (exit code, screen text)
fn run_program(source: &str) -> (i32, String) {
    let (mut m, _clock) = machine();
    m.write_file("/bin/prog", source.as_bytes()).unwrap();
    let pid = m.exec("/bin/prog", &[]).unwrap();
    m.run(2000);
    let code = m.reap(pid).expect("program should have exited");
    (code, m.console().screen_text())
}

#[test]
fn test_expression_exit_code() {
    let (code, screen) = run_program("int main() { return 2 + 3 * 4; }");
    assert_eq!(code, 14);
    assert_eq!(screen, "");
}

#[test]
fn test_recursive_fib_prints_89() {
    let (code, screen) = run_program(
        "#include \"io\"\n\
         int f(int i) { if (i < 2) return 1; return f(i - 1) + f(i - 2); }\n\
         int main() { put_int(f(10)); return 0; }",
    );
    assert_eq!(code, 0);
    assert_eq!(screen, "89");
}

#[test]
fn test_include_chain_compiles() {
    let (mut m, _clock) = machine();
    m.write_file("/bin/c_unit", b"int shared = 3;\n").unwrap();
    m.write_file("/bin/b_unit", b"#include \"c_unit\"\nint twice() { return shared * 2; }\n")
        .unwrap();
    m.write_file(
        "/bin/a_unit",
        b"#include \"b_unit\"\nint main() { return twice(); }\n",
    )
    .unwrap();
    let pid = m.exec("/bin/a_unit", &[]).unwrap();
    m.run(100);
    assert_eq!(m.reap(pid), Some(6));
}

#[test]
fn test_include_cycle_rejected() {
    let (mut m, _clock) = machine();
    m.write_file("/bin/a_cyc", b"#include \"b_cyc\"\nint main() { return 0; }\n")
        .unwrap();
    m.write_file("/bin/b_cyc", b"#include \"a_cyc\"\n").unwrap();
    let err = m.exec("/bin/a_cyc", &[]).unwrap_err();
    assert!(matches!(err, Error::IncludeCycle { .. }));
}

#[test]
fn test_redirected_pipeline_preserves_order() {
    let (mut m, _clock) = machine();
    m.write_file(
        "/bin/producer",
        b"#include \"io\"\nint main() { while (1) put_char(65); }",
    )
    .unwrap();
    m.write_file(
        "/bin/consumer",
        b"#include \"io\"\n\
          int main() { int c; for (;;) { c = input_char(); if (c < 0) break; put_char(c); } return 0; }",
    )
    .unwrap();
    let producer = m.exec("/bin/producer", &[]).unwrap();
    let consumer = m.exec("/bin/consumer", &[]).unwrap();
    m.set_output_redirect(producer, Some(consumer)).unwrap();
    for _ in 0..30 {
        m.tick();
    }
    let screen = m.console().screen_text();
    assert!(!screen.is_empty(), "consumer should have echoed bytes");
    assert!(
        screen.chars().all(|c| c == 'A' || c == '\n'),
        "only the producer's bytes reach the consumer, in order: {screen:?}"
    );
    // the producer never writes to the console directly, and both live on
    assert_eq!(m.process(producer).unwrap().state, CtxState::Running);

    // interrupt: the consumer's blocked read cancels and it exits
    m.raise_interrupt();
    for _ in 0..10 {
        m.tick();
    }
    assert_eq!(m.reap(consumer), Some(0));
}

#[test]
fn test_sleep_interrupted_early() {
    let (mut m, clock) = machine();
    m.write_file(
        "/bin/sleeper",
        b"#include \"io\"\nint main() { return sleep(500); }",
    )
    .unwrap();
    let pid = m.exec("/bin/sleeper", &[]).unwrap();
    m.tick();
    assert_eq!(m.process(pid).unwrap().state, CtxState::Waiting);

    clock.advance(400);
    m.tick();
    // still short of the deadline
    assert_eq!(m.process(pid).unwrap().state, CtxState::Waiting);

    m.raise_interrupt();
    m.tick(); // cancellation applies at tick end
    m.tick(); // the process resumes and exits immediately
    assert_eq!(m.reap(pid), Some(-1));
}

#[test]
fn test_sleep_completes_on_deadline() {
    let (mut m, clock) = machine();
    m.write_file(
        "/bin/napper",
        b"#include \"io\"\nint main() { return sleep(200); }",
    )
    .unwrap();
    let pid = m.exec("/bin/napper", &[]).unwrap();
    m.tick();
    assert_eq!(m.process(pid).unwrap().state, CtxState::Waiting);
    clock.advance(200);
    m.run(10);
    assert_eq!(m.reap(pid), Some(0));
}

#[test]
fn test_fork_wait_reaps_child_code() {
    let (code, _) = run_program(
        "#include \"io\"\n\
         int main() { int pid; pid = fork(); if (pid == 0) return 7; return wait(); }",
    );
    assert_eq!(code, 7);
}

#[test]
fn test_exec_spawns_and_wait_collects() {
    let (mut m, _clock) = machine();
    m.write_file("/bin/child", b"int main() { return 5; }").unwrap();
    m.write_file(
        "/bin/parent",
        b"#include \"io\"\n\
          int main() { int p; p = exec(\"/bin/child\"); if (p < 0) return 100; return wait(); }",
    )
    .unwrap();
    let pid = m.exec("/bin/parent", &[]).unwrap();
    m.run(500);
    assert_eq!(m.reap(pid), Some(5));
}

#[test]
fn test_guest_main_return_is_exit_code() {
    let (mut m, _clock) = machine();
    m.write_file("/bin/seventeen", b"int main() { return 17; }")
        .unwrap();
    let pid = m.exec("/bin/seventeen", &[]).unwrap();
    m.run(100);
    assert_eq!(m.process(pid).unwrap().state, CtxState::Zombie);
    assert_eq!(m.reap(pid), Some(17));
}

#[test]
fn test_string_interning_observable_from_guest() {
    // two identical literals compile to the same data address
    let (code, _) = run_program(
        "int main() { char *a; char *b; a = \"dup\"; b = \"dup\"; return a == b; }",
    );
    assert_eq!(code, 1);
}

#[test]
fn test_put_string_walks_pointer() {
    let (code, screen) = run_program(
        "#include \"io\"\nint main() { char *s; s = \"hi there\"; put_string(s); return 0; }",
    );
    assert_eq!(code, 0);
    assert_eq!(screen, "hi there");
}

#[test]
fn test_switch_fallthrough_and_default() {
    let (code, _) = run_program(
        "int pick(int c) {\n\
             int total;\n\
             total = 0;\n\
             switch (c) {\n\
                 case 1: total += 1;\n\
                 case 2: total += 2; break;\n\
                 case 3: total += 4; break;\n\
                 default: total += 8;\n\
             }\n\
             return total;\n\
         }\n\
         int main() { return pick(1) * 100 + pick(3) * 10 + pick(9); }",
    );
    // pick(1) falls through into case 2: 3; pick(3): 4; pick(9): 8
    assert_eq!(code, 348);
}

#[test]
fn test_struct_typedef_enum_globals() {
    let (code, _) = run_program(
        "struct point { int x; int y; };\n\
         typedef int word;\n\
         enum mode { OFF, ON = 4, AUTO };\n\
         int g = 5;\n\
         int main() {\n\
             struct point p;\n\
             word w;\n\
             p.x = 3;\n\
             p.y = 4;\n\
             w = 2;\n\
             return g + p.x * p.y + w + AUTO;\n\
         }",
    );
    assert_eq!(code, 24);
}

#[test]
fn test_pointer_arithmetic_through_heap() {
    let (code, _) = run_program(
        "#include \"io\"\n\
         int main() {\n\
             int *p;\n\
             p = (int*)malloc(40);\n\
             if (p == 0) return 1;\n\
             *p = 123;\n\
             p[1] = 4;\n\
             return *p + p[1] - 27;\n\
         }",
    );
    assert_eq!(code, 100);
}

#[test]
fn test_malloc_free_reuses_chunk() {
    let (code, _) = run_program(
        "#include \"io\"\n\
         int main() {\n\
             int a; int b;\n\
             a = malloc(64);\n\
             free(a);\n\
             b = malloc(64);\n\
             return a == b;\n\
         }",
    );
    assert_eq!(code, 1);
}

#[test]
fn test_float_arithmetic() {
    let (code, screen) = run_program(
        "#include \"io\"\n\
         int main() {\n\
             float x;\n\
             x = 2.5;\n\
             x = x * 2.0;\n\
             put_float(x);\n\
             if (x == 5.0) return 1;\n\
             return 0;\n\
         }",
    );
    assert_eq!(code, 1);
    assert_eq!(screen, "5");
}

#[test]
fn test_long_round_trip_through_memory() {
    let (code, _) = run_program(
        "int main() {\n\
             long a;\n\
             a = 6000000000;\n\
             a = a / 2;\n\
             return (int)(a / 1000000000);\n\
         }",
    );
    assert_eq!(code, 3);
}

#[test]
fn test_loops_agree_on_sum() {
    let (code, _) = run_program(
        "int sum_while(int n) { int s; s = 0; while (n > 0) { s += n; n--; } return s; }\n\
         int sum_for(int n) { int i; int s; for (i = 1, s = 0; i <= n; ++i) s += i; return s; }\n\
         int sum_do(int n) { int s; s = 0; do { s += n; n--; } while (n > 0); return s; }\n\
         int main() {\n\
             if (sum_while(10) != 55) return 1;\n\
             if (sum_for(10) != 55) return 2;\n\
             if (sum_do(10) != 55) return 3;\n\
             return 55;\n\
         }",
    );
    assert_eq!(code, 55);
}

#[test]
fn test_argv_reaches_main() {
    let (mut m, _clock) = machine();
    m.write_file(
        "/bin/echoargs",
        b"#include \"io\"\n\
          int main(int argc, char **argv) {\n\
              int i;\n\
              for (i = 0; i < argc; ++i) put_string(argv[i]);\n\
              return argc;\n\
          }",
    )
    .unwrap();
    let pid = m
        .exec("/bin/echoargs", &["ab".to_string(), "cd".to_string()])
        .unwrap();
    m.run(200);
    assert_eq!(m.reap(pid), Some(2));
    assert_eq!(m.console().screen_text(), "abcd");
}

#[test]
fn test_guest_reads_file_through_handle() {
    let (mut m, _clock) = machine();
    m.write_file("/home/motd", b"welcome").unwrap();
    m.write_file(
        "/bin/cat_motd",
        b"#include \"io\"\n\
          int main() {\n\
              int h; int c;\n\
              h = open(\"/home/motd\");\n\
              if (h < 0) return 1;\n\
              while ((c = read(h)) >= 0) put_char(c);\n\
              close(h);\n\
              return 0;\n\
          }",
    )
    .unwrap();
    let pid = m.exec("/bin/cat_motd", &[]).unwrap();
    m.run(200);
    assert_eq!(m.reap(pid), Some(0));
    assert_eq!(m.console().screen_text(), "welcome");
}

#[test]
fn test_guest_lists_directory_macro() {
    let (mut m, _clock) = machine();
    m.write_file(
        "/bin/lister",
        b"#include \"io\"\n\
          int main() {\n\
              int h; int c;\n\
              h = open(\"/bin:ls\");\n\
              if (h < 0) return 1;\n\
              while ((c = read(h)) >= 0) put_char(c);\n\
              close(h);\n\
              return 0;\n\
          }",
    )
    .unwrap();
    let pid = m.exec("/bin/lister", &[]).unwrap();
    m.run(500);
    assert_eq!(m.reap(pid), Some(0));
    let screen = m.console().screen_text();
    assert!(screen.contains("io"), "listing shows the runtime library: {screen:?}");
    assert!(screen.contains("lister"));
}

#[test]
fn test_proc_ps_reports_processes() {
    let (mut m, _clock) = machine();
    m.write_file(
        "/bin/dozer",
        b"#include \"io\"\nint main() { sleep(1000000); return 0; }",
    )
    .unwrap();
    m.write_file(
        "/bin/psdump",
        b"#include \"io\"\n\
          int main() {\n\
              int h; int c;\n\
              h = open(\"/proc/ps\");\n\
              if (h < 0) return 1;\n\
              while ((c = read(h)) >= 0) put_char(c);\n\
              close(h);\n\
              return 0;\n\
          }",
    )
    .unwrap();
    let dozer = m.exec("/bin/dozer", &[]).unwrap();
    m.run(10); // park the sleeper
    let pid = m.exec("/bin/psdump", &[]).unwrap();
    for _ in 0..100 {
        m.tick();
    }
    assert_eq!(m.reap(pid), Some(0));
    let screen = m.console().screen_text();
    assert!(screen.contains("PID"));
    assert!(screen.contains("/bin/dozer"));
    assert!(screen.contains("waiting"));
    assert_eq!(m.process(dozer).unwrap().state, CtxState::Waiting);
}

#[test]
fn test_console_line_input_round_trip() {
    let (mut m, _clock) = machine();
    m.write_file(
        "/bin/counter",
        b"#include \"io\"\n\
          int main() {\n\
              int c; int n;\n\
              n = 0;\n\
              input_lock();\n\
              while ((c = input_char()) >= 0) n++;\n\
              input_unlock();\n\
              return n;\n\
          }",
    )
    .unwrap();
    let pid = m.exec("/bin/counter", &[]).unwrap();
    m.tick();
    assert_eq!(m.process(pid).unwrap().state, CtxState::Waiting);

    // the user types a line; keys echo at the input mark
    m.key_press(b'h');
    m.key_press(b'i');
    m.key_press(b'\r');
    for _ in 0..10 {
        m.tick();
    }
    assert_eq!(m.reap(pid), Some(2));
    assert!(m.console().screen_text().contains("hi"));
}

#[test]
fn test_runtime_fault_reports_and_spares_siblings() {
    let (mut m, _clock) = machine();
    m.write_file(
        "/bin/crasher",
        b"int main() { int *p; p = (int*)1234; return *p; }",
    )
    .unwrap();
    m.write_file(
        "/bin/steady",
        b"#include \"io\"\nint main() { sleep(50); return 9; }",
    )
    .unwrap();
    let crasher = m.exec("/bin/crasher", &[]).unwrap();
    let steady = m.exec("/bin/steady", &[]).unwrap();
    m.run(10);
    // the faulting process died with a diagnostic; the sibling survives
    assert_eq!(m.process(crasher).unwrap().state, CtxState::Zombie);
    assert_eq!(m.reap(crasher), Some(-1));
    assert!(m.console().screen_text().contains("Page fault"));
    assert!(matches!(
        m.process(steady).unwrap().state,
        CtxState::Running | CtxState::Waiting
    ));
}

#[test]
fn test_divide_by_zero_faults() {
    let (mut m, _clock) = machine();
    m.write_file("/bin/div0", b"int main() { int z; z = 0; return 7 / z; }")
        .unwrap();
    let pid = m.exec("/bin/div0", &[]).unwrap();
    m.run(10);
    assert_eq!(m.reap(pid), Some(-1));
    assert!(m.console().screen_text().contains("Division by zero"));
}

#[test]
fn test_color_escape_protocol_from_guest() {
    let (mut m, _clock) = machine();
    m.write_file(
        "/bin/colored",
        b"#include \"io\"\n\
          int main() {\n\
              save_fg();\n\
              set_fg(255, 0, 0);\n\
              put_char('r');\n\
              restore_fg();\n\
              put_char('p');\n\
              return 0;\n\
          }",
    )
    .unwrap();
    let pid = m.exec("/bin/colored", &[]).unwrap();
    m.run(200);
    assert_eq!(m.reap(pid), Some(0));
    assert_eq!(m.console().row_text(0), "rp");
    // 'r' painted red, 'p' painted with the restored default
    assert_eq!(m.console().fg_at(0, 0), 0xFFFF_0000);
    assert_ne!(m.console().fg_at(0, 1), 0xFFFF_0000);
}

#[test]
fn test_set_cycle_pins_budget() {
    let (mut m, _clock) = machine();
    m.write_file(
        "/bin/tuner",
        b"#include \"io\"\nint main() { set_cycle(7777); return 0; }",
    )
    .unwrap();
    let pid = m.exec("/bin/tuner", &[]).unwrap();
    m.run(100);
    assert_eq!(m.reap(pid), Some(0));
    assert_eq!(m.console().tuner().cycle(), 7777);
    // auto-tuning no longer moves the pinned value
    m.observe_fps(120.0);
    assert_eq!(m.console().tuner().cycle(), 7777);
}

#[test]
fn test_compile_error_reports_position() {
    let (mut m, _clock) = machine();
    m.write_file("/bin/broken", b"int main() { return missing; }")
        .unwrap();
    let err = m.exec("/bin/broken", &[]).unwrap_err();
    match err {
        Error::Undeclared { name, line, .. } => {
            assert_eq!(name, "missing");
            assert_eq!(line, 1);
        }
        other => panic!("expected an undeclared-identifier diagnostic, got {other}"),
    }
}

#[test]
fn test_ternary_comma_and_logicals() {
    let (code, _) = run_program(
        "int main() {\n\
             int a; int b;\n\
             a = (1 && 2) ? 10 : 20;\n\
             b = (0 || 0) ? 1 : 2;\n\
             a = (a, b, a + b);\n\
             return a;\n\
         }",
    );
    assert_eq!(code, 12);
}

#[test]
fn test_short_circuit_skips_side_effects() {
    let (code, _) = run_program(
        "int hits = 0;\n\
         int bump() { hits = hits + 1; return 1; }\n\
         int main() {\n\
             0 && bump();\n\
             1 || bump();\n\
             1 && bump();\n\
             return hits;\n\
         }",
    );
    assert_eq!(code, 1);
}
