//! End-to-end command scenarios, driven through real processes
//! (`sh`, `cat`, `echo`, `sleep`, `printf`).

#![cfg(unix)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use shellpipe::{CancellationToken, Error, Shell};

fn shell() -> Shell {
    Shell::new()
}

fn pid_alive(pid: u32) -> bool {
    std::process::Command::new("sh")
        .arg("-c")
        .arg(format!("kill -0 {pid} 2>/dev/null"))
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

#[tokio::test]
async fn simple_echo() {
    let mut cmd = shell()
        .run_with("echo", ["abcd"], |opts| {
            opts.timeout(Duration::from_secs(5));
        })
        .unwrap();
    let result = cmd.wait().await.unwrap();
    assert_eq!(result.exit_code(), 0);
    assert!(result.success());
    assert_eq!(result.stdout().await.unwrap(), "abcd\n");
    assert_eq!(result.stderr().await.unwrap(), "");
}

#[tokio::test]
async fn stdin_feeds_cat() {
    let mut cmd = shell()
        .run("cat", Vec::<String>::new())
        .unwrap()
        .stdin_from_bytes("abcd\n")
        .unwrap();
    let result = cmd.wait().await.unwrap();
    assert_eq!(result.stdout().await.unwrap(), "abcd\n");
}

#[tokio::test]
async fn timeout_kills_the_process() {
    let start = std::time::Instant::now();
    let mut cmd = shell()
        .run_with("sleep", ["10000"], |opts| {
            opts.timeout(Duration::from_millis(50));
        })
        .unwrap();
    let pid = cmd.pid().unwrap();
    assert_eq!(cmd.wait().await.unwrap_err(), Error::Timeout);

    // The process must be gone shortly after the timeout fired.
    let deadline = start + Duration::from_millis(500);
    while pid_alive(pid) {
        assert!(std::time::Instant::now() < deadline, "process outlived its timeout");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // Kill after the fact is safe, repeatedly.
    cmd.kill();
    cmd.kill();
}

#[tokio::test]
async fn cancellation_kills_and_surfaces() {
    let token = CancellationToken::new();
    let mut cmd = shell()
        .run_with("sleep", ["10000"], |opts| {
            opts.cancellation_token(token.clone());
        })
        .unwrap();
    let pid = cmd.pid().unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    token.cancel();

    assert_eq!(cmd.wait().await.unwrap_err(), Error::Cancelled);
    assert!(!pid_alive(pid));
    cmd.kill();
}

#[tokio::test]
async fn pre_cancelled_token_still_reports_cancelled() {
    let token = CancellationToken::new();
    token.cancel();
    let mut cmd = shell()
        .run_with("sleep", ["10000"], |opts| {
            opts.cancellation_token(token);
        })
        .unwrap();
    assert_eq!(cmd.wait().await.unwrap_err(), Error::Cancelled);
    cmd.kill();
}

#[tokio::test]
async fn throw_on_error_reports_the_exit_code() {
    let mut cmd = shell()
        .run_with("sh", ["-c", "exit 3"], |opts| {
            opts.throw_on_error(true);
        })
        .unwrap();
    let err = cmd.wait().await.unwrap_err();
    assert_eq!(err, Error::ErrorExitCode(3));
    assert_eq!(err.exit_code(), Some(3));
}

#[tokio::test]
async fn non_zero_exit_without_throw_is_a_result() {
    let mut cmd = shell().run("sh", ["-c", "exit 3"]).unwrap();
    let result = cmd.wait().await.unwrap();
    assert_eq!(result.exit_code(), 3);
    assert!(!result.success());
}

#[tokio::test]
async fn write_after_exit_is_a_no_op() {
    let mut cmd = shell().run("sh", ["-c", "exit 1"]).unwrap();
    let mut stdin = cmd.stdin().unwrap();
    let result = cmd.wait().await.unwrap();
    assert_eq!(result.exit_code(), 1);

    stdin.write_line("").await.unwrap();
    stdin.write(&[0x61]).await.unwrap();
    stdin.flush().await.unwrap();
}

#[tokio::test]
async fn negative_exit_codes_are_truncated_on_posix() {
    let mut cmd = shell().run("sh", ["-c", "exit 255"]).unwrap();
    let result = cmd.wait().await.unwrap();
    assert_eq!(result.exit_code(), -1i32 & 0xff);
}

#[tokio::test]
async fn arguments_round_trip_verbatim() {
    let args = [
        "c:\\temp",
        "a\\\\b",
        "\\\\\\",
        "``\"`\\\\",
        "C:\\temp\\blah",
        " leading and trailing\twhitespace!  ",
    ];
    let mut printf_args = vec!["%s\n"];
    printf_args.extend(args);
    let mut cmd = shell().run("printf", printf_args).unwrap();
    let result = cmd.wait().await.unwrap();
    let expected: String = args.iter().map(|a| format!("{a}\n")).collect();
    assert_eq!(result.stdout().await.unwrap(), expected);
}

#[tokio::test]
async fn pipe_chain_carries_bytes_end_to_end() {
    let mut chain = shell().run("echo", ["hello"]).unwrap()
        | shell().run("cat", Vec::<String>::new()).unwrap()
        | shell().run("cat", Vec::<String>::new()).unwrap();
    assert_eq!(chain.pids().len(), 3);
    let result = chain.wait().await.unwrap();
    assert_eq!(result.exit_code(), 0);
    assert_eq!(result.stdout().await.unwrap(), "hello\n");
}

#[tokio::test]
async fn chain_stdin_reaches_the_tail_verbatim() {
    let payload: Vec<u8> = (0..128 * 1024).map(|i| (i % 251) as u8).collect();
    let chain = shell().run("cat", Vec::<String>::new()).unwrap()
        | shell().run("cat", Vec::<String>::new()).unwrap()
        | shell().run("cat", Vec::<String>::new()).unwrap();
    let mut chain = chain.stdin_from_bytes(payload.clone()).unwrap();
    let result = chain.wait().await.unwrap();
    assert_eq!(result.stdout().await.unwrap().as_bytes(), payload.as_slice());
}

#[tokio::test(flavor = "multi_thread")]
async fn chain_backpressure_blocks_the_head_until_the_tail_reads() {
    // Four cats; every inter-command pipe runs fixed-length. The chain can
    // only buffer a bounded amount, so a multi-megabyte head write cannot
    // finish until the tail is drained.
    let payload: Vec<u8> = (0..4 * 1024 * 1024).map(|i| (i % 239) as u8).collect();
    let mut chain = shell().run("cat", Vec::<String>::new()).unwrap()
        | shell().run("cat", Vec::<String>::new()).unwrap()
        | shell().run("cat", Vec::<String>::new()).unwrap()
        | shell().run("cat", Vec::<String>::new()).unwrap();

    let mut head = chain.stdin().unwrap();
    let mut tail = chain.stdout().unwrap();
    // Bound the tail capture as well, so total resident bytes stay fixed.
    tail.stop_buffering();

    let to_write = payload.clone();
    let write = tokio::spawn(async move {
        head.write(&to_write).await.unwrap();
        head.close();
    });

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!write.is_finished(), "head write completed before the tail was read");

    let drain = async {
        let mut collected = Vec::with_capacity(payload.len());
        let mut chunk = vec![0u8; 64 * 1024];
        loop {
            let n = tail.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            collected.extend_from_slice(&chunk[..n]);
        }
        collected
    };
    let collected = tokio::time::timeout(Duration::from_secs(10), drain)
        .await
        .expect("chain did not drain in time");
    tokio::time::timeout(Duration::from_secs(10), write)
        .await
        .expect("head write did not finish")
        .unwrap();
    assert_eq!(collected, payload);

    let result = chain.wait().await.unwrap();
    assert_eq!(result.exit_code(), 0);
}

#[tokio::test]
async fn merged_lines_preserve_per_stream_order() {
    let mut cmd = shell()
        .run(
            "sh",
            ["-c", "echo out1; echo err1 1>&2; echo out2; echo err2 1>&2"],
        )
        .unwrap();
    let mut merged = cmd.merged_lines().unwrap();

    let mut stdout_lines = Vec::new();
    let mut stderr_lines = Vec::new();
    while let Some((source, line)) = merged.next().await {
        match source.as_str() {
            "stdout" => stdout_lines.push(line),
            _ => stderr_lines.push(line),
        }
    }
    assert_eq!(stdout_lines, ["out1", "out2"]);
    assert_eq!(stderr_lines, ["err1", "err2"]);

    // The streams are consumed: a second merge reports the claim.
    assert_eq!(cmd.merged_lines().unwrap_err(), Error::StreamClaimed);
    cmd.wait().await.unwrap();
}

#[tokio::test]
async fn file_redirection_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("input.txt");
    let output = dir.path().join("output.txt");
    tokio::fs::write(&input, b"line one\nline two\n").await.unwrap();

    let mut cmd = shell()
        .run("cat", Vec::<String>::new())
        .unwrap()
        .stdin_from_file(&input)
        .unwrap()
        .stdout_to_file(&output)
        .unwrap();
    let result = cmd.wait().await.unwrap();
    assert!(result.success());

    let copied = tokio::fs::read(&output).await.unwrap();
    assert_eq!(copied, b"line one\nline two\n");

    // The redirected stream is claimed on the result too.
    assert_eq!(result.stdout().await.unwrap_err(), Error::StreamClaimed);
}

#[tokio::test]
async fn line_collection_sinks_capture_output() {
    let lines = Arc::new(Mutex::new(Vec::new()));
    let mut cmd = shell()
        .run("sh", ["-c", "echo alpha; echo beta"])
        .unwrap()
        .stdout_to_lines(Arc::clone(&lines))
        .unwrap();
    cmd.wait().await.unwrap();
    assert_eq!(*lines.lock().unwrap(), ["alpha", "beta"]);
}

#[tokio::test]
async fn stdin_from_chars_feeds_utf8() {
    let mut cmd = shell()
        .run("cat", Vec::<String>::new())
        .unwrap()
        .stdin_from_chars("héllo\n".chars())
        .unwrap();
    let result = cmd.wait().await.unwrap();
    assert_eq!(result.stdout().await.unwrap(), "héllo\n");
}

#[tokio::test]
async fn stdin_from_lines_appends_terminators() {
    let mut cmd = shell()
        .run("cat", Vec::<String>::new())
        .unwrap()
        .stdin_from_lines(["one", "two"])
        .unwrap();
    let result = cmd.wait().await.unwrap();
    assert_eq!(result.stdout().await.unwrap(), "one\ntwo\n");
}

#[tokio::test]
async fn stream_accessors_are_one_shot() {
    let mut cmd = shell().run("echo", ["x"]).unwrap();
    let _stdout = cmd.stdout().unwrap();
    assert_eq!(cmd.stdout().unwrap_err(), Error::StreamClaimed);

    let result = cmd.wait().await.unwrap();
    assert_eq!(result.stdout().await.unwrap_err(), Error::StreamClaimed);
    // Stderr stayed with the command.
    assert_eq!(result.stderr().await.unwrap(), "");
}

#[tokio::test]
async fn wait_resolves_exactly_once_and_caches() {
    let mut cmd = shell().run("echo", ["once"]).unwrap();
    let first = cmd.wait().await.unwrap();
    let second = cmd.wait().await.unwrap();
    assert_eq!(first.exit_code(), second.exit_code());
    assert_eq!(second.stdout().await.unwrap(), "once\n");
}

#[tokio::test]
async fn kill_produces_a_signal_exit_code() {
    let mut cmd = shell().run("sleep", ["10000"]).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    cmd.kill();
    cmd.kill();
    let result = cmd.wait().await.unwrap();
    assert_eq!(result.exit_code(), -1);
}

#[tokio::test]
async fn shell_defaults_layer_under_per_call_overrides() {
    let strict = Shell::with_options(|opts| {
        opts.throw_on_error(true);
    });

    let mut failing = strict.run("sh", ["-c", "exit 1"]).unwrap();
    assert_eq!(failing.wait().await.unwrap_err(), Error::ErrorExitCode(1));

    let mut relaxed = strict
        .run_with("sh", ["-c", "exit 1"], |opts| {
            opts.throw_on_error(false);
        })
        .unwrap();
    assert_eq!(relaxed.wait().await.unwrap().exit_code(), 1);
}

#[tokio::test]
async fn working_directory_and_environment_apply() {
    let dir = tempfile::tempdir().unwrap();
    let mut cmd = shell()
        .run_with("sh", ["-c", "pwd; printf '%s\\n' \"$MARKER\""], |opts| {
            opts.working_directory(dir.path())
                .environment_variable("MARKER", "present");
        })
        .unwrap();
    let result = cmd.wait().await.unwrap();
    let stdout = result.stdout().await.unwrap();
    let mut lines = stdout.lines();
    let cwd = lines.next().unwrap();
    assert_eq!(
        std::fs::canonicalize(cwd).unwrap(),
        std::fs::canonicalize(dir.path()).unwrap()
    );
    assert_eq!(lines.next().unwrap(), "present");
}

#[tokio::test]
async fn empty_program_is_rejected() {
    assert!(matches!(
        shell().run("", Vec::<String>::new()),
        Err(Error::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn zero_timeout_is_rejected() {
    let result = shell().run_with("echo", ["x"], |opts| {
        opts.timeout(Duration::ZERO);
    });
    assert!(matches!(result, Err(Error::InvalidArgument(_))));
}

#[tokio::test]
async fn attach_observes_a_foreign_exit() {
    let mut target = shell().run("sleep", ["1000"]).unwrap();
    let pid = target.pid().unwrap();

    let mut attached = shell().try_attach(pid).unwrap().expect("attach to live process");
    assert_eq!(attached.pid().unwrap(), pid);
    assert_eq!(attached.stdout().unwrap_err(), Error::StreamNotRedirected);
    assert_eq!(attached.stdin().unwrap_err(), Error::StreamNotRedirected);

    attached.kill();
    let result = attached.wait().await.unwrap();
    // A foreign pid cannot be reaped; the exit code is the unknown
    // sentinel.
    assert_eq!(result.exit_code(), -1);

    target.wait().await.unwrap();
}

#[tokio::test]
async fn attach_to_a_dead_pid_is_a_soft_failure() {
    let mut child = std::process::Command::new("true").spawn().unwrap();
    let pid = child.id();
    child.wait().unwrap();
    assert!(shell().try_attach(pid).unwrap().is_none());
    // pid 0 is never attachable.
    assert!(shell().try_attach(0).unwrap().is_none());
}

#[tokio::test]
async fn attach_rejects_spawn_only_options() {
    let result = shell().try_attach_with(1, |opts| {
        opts.working_directory("/tmp");
    });
    assert_eq!(result.unwrap_err(), Error::InvalidAttachOptions);
}

#[tokio::test]
async fn attached_command_honors_cancellation() {
    let mut target = shell().run("sleep", ["1000"]).unwrap();
    let pid = target.pid().unwrap();

    let token = CancellationToken::new();
    let mut attached = shell()
        .try_attach_with(pid, |opts| {
            opts.cancellation_token(token.clone());
        })
        .unwrap()
        .expect("attach to live process");

    tokio::time::sleep(Duration::from_millis(50)).await;
    token.cancel();
    assert_eq!(attached.wait().await.unwrap_err(), Error::Cancelled);

    // The spawning command reaps the child; the pid disappears once it
    // has.
    target.wait().await.unwrap();
    assert!(!pid_alive(pid));
}

#[tokio::test]
async fn discard_stops_capturing_output() {
    let mut cmd = shell()
        .run("sh", ["-c", "echo early; sleep 0.1; echo late"])
        .unwrap();
    let mut stdout = cmd.stdout().unwrap();
    stdout.discard();

    let mut chunk = [0u8; 64];
    assert_eq!(stdout.read(&mut chunk).await.unwrap(), 0);
    let result = cmd.wait().await.unwrap();
    assert!(result.success());
}

#[tokio::test]
async fn command_mutators_run_after_creation() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let record = Arc::clone(&seen);
    let mut cmd = shell()
        .run_with("echo", ["x"], move |opts| {
            opts.command(move |cmd| {
                record.lock().unwrap().push(cmd.pids().len());
            });
        })
        .unwrap();
    cmd.wait().await.unwrap();
    assert_eq!(*seen.lock().unwrap(), [1]);
}
