use anyhow::{Result, bail};
use forkvm_test_util::programs;
use std::fs;
use std::path::Path;
use std::process::{Command, Output};
use tempfile::TempDir;

fn forkvm(args: &[&str]) -> Result<Output> {
    Ok(Command::new(env!("CARGO_BIN_EXE_forkvm"))
        .args(args)
        .env("FORKVM_LOG", "forkvm=debug")
        .output()?)
}

fn run_forkvm(args: &[&str]) -> Result<String> {
    let output = forkvm(args)?;
    if !output.status.success() {
        bail!(
            "Failed to execute forkvm with: {args:?}\n{}",
            String::from_utf8_lossy(&output.stderr)
        );
    }
    Ok(String::from_utf8(output.stdout)?)
}

fn write_program(dir: &Path, name: &str, binary: &[u8]) -> Result<String> {
    let path = dir.join(name);
    fs::write(&path, binary)?;
    Ok(path.to_str().unwrap().to_string())
}

#[test]
fn run_prints_first_buffer() -> Result<()> {
    let dir = TempDir::new()?;
    let program = write_program(dir.path(), "hello.elf", &programs::hello_world())?;
    let stdout = run_forkvm(&["run", &program])?;
    assert_eq!(stdout.as_bytes(), programs::HELLO);
    Ok(())
}

#[test]
fn run_invokes_named_function() -> Result<()> {
    let dir = TempDir::new()?;
    let program = write_program(dir.path(), "api.elf", &programs::guest_api())?;
    let stdout = run_forkvm(&["run", "--invoke", "whoami", "--name", "cli-tenant", &program])?;
    assert_eq!(stdout, "cli-tenant");
    Ok(())
}

#[test]
fn run_failures() -> Result<()> {
    let dir = TempDir::new()?;
    let looping = write_program(dir.path(), "loop.elf", &programs::infinite_loop())?;
    let output = forkvm(&["run", "--max-instructions", "1000", &looping])?;
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("exceeded 1000 instructions"));

    let output = forkvm(&["run", "--invoke", "missing", &looping])?;
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("failed to find function"));

    let broken = write_program(dir.path(), "broken.elf", &programs::init_crash())?;
    assert!(run_forkvm(&["run", &broken]).is_err());

    assert!(run_forkvm(&["run", "/nonexistent/program.elf"]).is_err());
    Ok(())
}

#[test]
fn bench_reports_each_tenant() -> Result<()> {
    let dir = TempDir::new()?;
    write_program(dir.path(), "hello.elf", &programs::hello_world())?;
    write_program(dir.path(), "large.elf", &programs::large_response())?;
    let config = dir.path().join("tenants.toml");
    fs::write(
        &config,
        r#"
[[tenant]]
name = "hello"
group = "bench"
filename = "hello.elf"
max-instructions = "1M"
max-memory = "16Mi"
max-heap = "1Mi"

[[tenant]]
name = "large"
group = "bench"
filename = "large.elf"
max-instructions = 100000
max-memory = "16Mi"
max-heap = "1Mi"
"#,
    )?;
    let stdout = run_forkvm(&[
        "bench",
        "--config",
        config.to_str().unwrap(),
        "--threads",
        "2",
        "--iterations",
        "10",
        "--reserve-pages",
        "8",
    ])?;
    let lines: Vec<_> = stdout.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].starts_with("hello: 20 requests on 2 threads"));
    assert!(lines[0].contains("20 ok"));
    assert!(lines[1].starts_with("large: 20 requests"));
    assert!(lines[1].contains("200000 bytes gathered"));
    Ok(())
}
