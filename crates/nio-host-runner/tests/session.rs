use std::sync::Arc;
use std::time::Duration;

use nio_host_runner::{
    ExecError, ExecRequest, RunnerLimits, Session, SessionOptions, StdStream, StdinPolicy,
};


async fn session(options: SessionOptions) -> Session {
    Session::load(&nio_fixture::cache(), options)
        .await
        .expect("load session")
}

fn text(bytes: &[u8]) -> &str {
    std::str::from_utf8(bytes).expect("utf8")
}

#[tokio::test]
async fn fresh_session_has_empty_streams_and_missing_files() {
    let session = session(SessionOptions::default()).await;
    let vfs = session.vfs().await;
    for stream in StdStream::ALL {
        assert!(vfs.stream(stream).is_empty());
    }
    let err = vfs.read("/main.nio").unwrap_err();
    assert!(err.is_not_found(), "err={err}");
}

#[tokio::test]
async fn stdin_accumulates_across_executions() {
    let session = session(SessionOptions::default()).await;
    assert_eq!(session.stdin_policy(), StdinPolicy::Accumulate);

    session.append_stdin("(1 2)\n").await.expect("stdin");
    let first = session
        .exec_capture(ExecRequest::new(["parse"]))
        .await
        .expect("first exec");
    assert_eq!(first.result.exit_code, 0);
    assert_eq!(first.stdout_text(), "Ok((1 2))\n");

    // The second run sees both lines, so the dangling paren fails the parse.
    session.append_stdin("(3\n").await.expect("stdin");
    let second = session
        .exec_capture(ExecRequest::new(["parse"]))
        .await
        .expect("second exec");
    assert_eq!(second.result.exit_code, 1);
    assert_eq!(second.stdout_text(), "");
    assert_eq!(second.stderr_text(), "Error: unbalanced parentheses\n");

    let vfs = session.vfs().await;
    assert_eq!(text(vfs.stream(StdStream::Stdin)), "(1 2)\n(3\n");
    assert_eq!(text(vfs.stream(StdStream::Stdout)), "Ok((1 2))\n");
}

#[tokio::test]
async fn clear_after_exec_resets_stdin_only() {
    let session = session(SessionOptions {
        stdin_policy: StdinPolicy::ClearAfterExec,
        ..SessionOptions::default()
    })
    .await;

    session.append_stdin("(a)\n").await.expect("stdin");
    let first = session
        .exec_capture(ExecRequest::new(["parse"]))
        .await
        .expect("exec");
    assert_eq!(first.stdout_text(), "Ok((a))\n");

    session.append_stdin("(b)\n").await.expect("stdin");
    let second = session
        .exec_capture(ExecRequest::new(["parse"]))
        .await
        .expect("exec");
    assert_eq!(second.stdout_text(), "Ok((b))\n");

    assert!(session.vfs().await.stream(StdStream::Stdin).is_empty());
    assert_eq!(text(&session.stdout().await), "Ok((a))\nOk((b))\n");
}

#[tokio::test]
async fn output_streams_never_shrink() {
    let session = session(SessionOptions::default()).await;
    let mut last = (0, 0);
    let runs: [&[&str]; 5] = [&["--version"], &["parse"], &["trap"], &["nope"], &["--version"]];
    for args in runs {
        let _ = session.exec(ExecRequest::new(args.iter().copied())).await;
        let vfs = session.vfs().await;
        let now = (
            vfs.stream_len(StdStream::Stdout),
            vfs.stream_len(StdStream::Stderr),
        );
        assert!(now.0 >= last.0 && now.1 >= last.1, "{last:?} -> {now:?}");
        last = now;
    }
    assert_eq!(
        text(&session.stdout().await),
        "nio 0.1.0-test\nnio 0.1.0-test\n"
    );
}

#[tokio::test]
async fn fault_leaves_the_session_usable() {
    let session = session(SessionOptions::default()).await;
    session.write_file("/notes.txt", "kept").await.expect("write");

    let err = session.exec(ExecRequest::new(["trap"])).await.unwrap_err();
    assert!(matches!(err, ExecError::Fault { .. }), "err={err:?}");
    assert_eq!(
        session.read_file("/notes.txt").await.expect("read"),
        b"kept"
    );

    let res = session
        .exec(ExecRequest::new(["--version"]))
        .await
        .expect("exec");
    assert_eq!(res.exit_code, 0);
}

#[tokio::test]
async fn program_sees_files_written_by_the_host() {
    let session = session(SessionOptions::default()).await;
    session.vfs().await.create_dir_all("/lib").expect("mkdir");
    session
        .write_file("/lib/prelude.nio", "(def x 1)\n")
        .await
        .expect("write");

    let out = session
        .exec_capture(ExecRequest::new(["cat", "lib/prelude.nio"]))
        .await
        .expect("exec");
    assert_eq!(out.stdout_text(), "(def x 1)\n");

    session.append_stdin("generated\n").await.expect("stdin");
    session
        .exec(ExecRequest::new(["write", "lib/out.nio"]))
        .await
        .expect("exec");
    assert_eq!(
        session.read_file("/lib/out.nio").await.expect("read"),
        b"generated\n"
    );
}

#[tokio::test]
async fn env_is_opt_in() {
    let session = session(SessionOptions {
        env: vec![("NIO_COLOR".to_string(), "never".to_string())],
        ..SessionOptions::default()
    })
    .await;
    let out = session
        .exec_capture(ExecRequest::new(["env"]))
        .await
        .expect("exec");
    assert_eq!(out.stdout_text(), "NIO_COLOR=never\n");
}

#[tokio::test]
async fn session_limits_apply_to_every_exec() {
    let session = session(SessionOptions {
        limits: RunnerLimits {
            fuel: Some(500_000),
            ..RunnerLimits::default()
        },
        ..SessionOptions::default()
    })
    .await;
    let err = session.exec(ExecRequest::new(["spin"])).await.unwrap_err();
    assert_eq!(
        err,
        ExecError::Fault {
            trap: "fuel exhausted".to_string()
        }
    );
    let res = session
        .exec(ExecRequest::new(["--version"]))
        .await
        .expect("exec");
    assert!(res.fuel_used.is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_execs_are_serialized() {
    let session = Arc::new(session(SessionOptions::default()).await);
    let mut tasks = Vec::new();
    for _ in 0..8 {
        let session = Arc::clone(&session);
        tasks.push(tokio::spawn(async move {
            session.exec_capture(ExecRequest::new(["--version"])).await
        }));
    }
    for task in tasks {
        let out = task.await.expect("join").expect("exec");
        assert_eq!(out.stdout_text(), "nio 0.1.0-test\n");
    }
    assert_eq!(
        text(&session.stdout().await),
        "nio 0.1.0-test\n".repeat(8)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn try_exec_is_busy_while_a_run_is_in_flight() {
    let session = Arc::new(
        session(SessionOptions {
            limits: RunnerLimits {
                fuel: Some(300_000_000),
                ..RunnerLimits::default()
            },
            ..SessionOptions::default()
        })
        .await,
    );

    let running = {
        let session = Arc::clone(&session);
        tokio::spawn(async move { session.exec(ExecRequest::new(["spin"])).await })
    };
    let busy = loop {
        match session.try_exec(ExecRequest::new(["return"])).await {
            Ok(_) => tokio::time::sleep(Duration::from_millis(1)).await,
            Err(err) => break err,
        }
    };
    assert_eq!(busy, ExecError::Busy);

    let spun = running.await.expect("join");
    assert!(matches!(spun, Err(ExecError::Fault { .. })), "spun={spun:?}");
    let res = session
        .try_exec(ExecRequest::new(["return"]))
        .await
        .expect("idle again");
    assert_eq!(res.exit_code, 0);
}

#[tokio::test]
async fn dropped_exec_future_still_completes_the_run() {
    let session = session(SessionOptions::default()).await;
    session.append_stdin("()\n").await.expect("stdin");
    {
        let fut = session.exec(ExecRequest::new(["parse"]));
        let _ = tokio::time::timeout(Duration::from_nanos(1), fut).await;
    }
    // The next exec queues behind whatever was started, so the stream is
    // consistent when it returns.
    let out = session
        .exec_capture(ExecRequest::new(["--version"]))
        .await
        .expect("exec");
    assert_eq!(out.stdout_text(), "nio 0.1.0-test\n");
    let stdout = session.stdout().await;
    let stdout = text(&stdout);
    assert!(
        stdout == "nio 0.1.0-test\n" || stdout == "Ok(())\nnio 0.1.0-test\n",
        "stdout={stdout:?}"
    );
}
