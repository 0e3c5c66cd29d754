/// Wire protocol for the fork-server control socket
///
/// One request/response per connection. Every string travels as a u32
/// big-endian byte length followed by the bytes. A request is four strings in
/// order: target root dir, target NS pid, space-joined package list, and a
/// "1"/"0" launch-lambda flag. The response is an i32 big-endian status code
/// followed by one string: the child pid on status 0, an error message
/// otherwise.
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;

use crate::types::{CacheError, Result};

/// Upper bound on a single response string; anything larger is a framing bug.
const MAX_FRAME: u32 = 1 << 20;

/// Ask the fork server behind `sock` to fork a child into the target
/// namespace. With `launch` unset the child imports `packages` and becomes a
/// new fork server; with `launch` set it starts the lambda entrypoint.
/// Returns the child pid in the target namespace.
pub fn fork_request(
    sock: &Path,
    target_root: &Path,
    target_ns_pid: &str,
    packages: &[String],
    launch: bool,
    timeout: Duration,
) -> Result<u32> {
    let mut stream = UnixStream::connect(sock)?;
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;

    let exchange = |stream: &mut UnixStream| -> Result<(i32, String)> {
        write_str(stream, &target_root.to_string_lossy())?;
        write_str(stream, target_ns_pid)?;
        write_str(stream, &packages.join(" "))?;
        write_str(stream, if launch { "1" } else { "0" })?;

        let status = read_i32(stream)?;
        let payload = read_str(stream)?;
        Ok((status, payload))
    };

    let (status, payload) = exchange(&mut stream).map_err(|e| match e {
        CacheError::Io(io) if is_timeout(&io) => CacheError::Timeout(format!(
            "fork request through {:?} exceeded {:?}",
            sock, timeout
        )),
        other => other,
    })?;

    if status != 0 {
        return Err(CacheError::Interpreter(format!(
            "fork request failed with status {}: {}",
            status, payload
        )));
    }

    payload.trim().parse().map_err(|_| {
        CacheError::Interpreter(format!("fork request returned malformed pid {:?}", payload))
    })
}

/// Read one request frame. Used by in-process fork-server doubles; the
/// production peer is the interpreter shipped with the sandbox image.
pub fn read_request(stream: &mut UnixStream) -> Result<ForkRequestFrame> {
    let target_root = read_str(stream)?;
    let target_ns_pid = read_str(stream)?;
    let packages_raw = read_str(stream)?;
    let launch_raw = read_str(stream)?;

    let packages = packages_raw
        .split_whitespace()
        .map(str::to_string)
        .collect();

    Ok(ForkRequestFrame {
        target_root,
        target_ns_pid,
        packages,
        launch: launch_raw == "1",
    })
}

/// Write a success response carrying the child pid.
pub fn write_pid(stream: &mut UnixStream, pid: u32) -> Result<()> {
    stream.write_all(&0i32.to_be_bytes())?;
    write_str(stream, &pid.to_string())
}

/// Write a failure response.
pub fn write_error(stream: &mut UnixStream, code: i32, message: &str) -> Result<()> {
    stream.write_all(&code.to_be_bytes())?;
    write_str(stream, message)
}

/// A decoded fork request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForkRequestFrame {
    pub target_root: String,
    pub target_ns_pid: String,
    pub packages: Vec<String>,
    pub launch: bool,
}

fn is_timeout(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}

fn write_str(stream: &mut UnixStream, value: &str) -> Result<()> {
    let bytes = value.as_bytes();
    stream.write_all(&(bytes.len() as u32).to_be_bytes())?;
    stream.write_all(bytes)?;
    Ok(())
}

fn read_str(stream: &mut UnixStream) -> Result<String> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME {
        return Err(CacheError::Interpreter(format!(
            "oversized frame of {} bytes",
            len
        )));
    }

    let mut buf = vec![0u8; len as usize];
    stream.read_exact(&mut buf)?;
    String::from_utf8(buf)
        .map_err(|_| CacheError::Interpreter("frame is not valid UTF-8".to_string()))
}

fn read_i32(stream: &mut UnixStream) -> Result<i32> {
    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf)?;
    Ok(i32::from_be_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixListener;
    use std::path::PathBuf;

    fn serve_one<F>(handler: F) -> (tempfile::TempDir, PathBuf, std::thread::JoinHandle<()>)
    where
        F: FnOnce(&mut UnixStream) + Send + 'static,
    {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("fs.sock");
        let listener = UnixListener::bind(&sock).unwrap();

        let handle = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            handler(&mut stream);
        });

        (dir, sock, handle)
    }

    #[test]
    fn test_round_trip() {
        let (_dir, sock, handle) = serve_one(|stream| {
            let req = read_request(stream).unwrap();
            assert_eq!(req.target_root, "/sandbox/root");
            assert_eq!(req.target_ns_pid, "4242");
            assert_eq!(req.packages, vec!["numpy", "flask"]);
            assert!(req.launch);
            write_pid(stream, 77).unwrap();
        });

        let pid = fork_request(
            &sock,
            Path::new("/sandbox/root"),
            "4242",
            &["numpy".to_string(), "flask".to_string()],
            true,
            Duration::from_secs(1),
        )
        .unwrap();

        assert_eq!(pid, 77);
        handle.join().unwrap();
    }

    #[test]
    fn test_empty_package_list() {
        let (_dir, sock, handle) = serve_one(|stream| {
            let req = read_request(stream).unwrap();
            assert!(req.packages.is_empty());
            assert!(!req.launch);
            write_pid(stream, 1).unwrap();
        });

        fork_request(
            &sock,
            Path::new("/r"),
            "1",
            &[],
            false,
            Duration::from_secs(1),
        )
        .unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn test_nonzero_status_is_interpreter_error() {
        let (_dir, sock, handle) = serve_one(|stream| {
            let _ = read_request(stream).unwrap();
            write_error(stream, 3, "import failed: no module named nope").unwrap();
        });

        let err = fork_request(
            &sock,
            Path::new("/r"),
            "1",
            &["nope".to_string()],
            false,
            Duration::from_secs(1),
        )
        .unwrap_err();

        match err {
            CacheError::Interpreter(msg) => assert!(msg.contains("status 3")),
            other => panic!("expected interpreter error, got {:?}", other),
        }
        handle.join().unwrap();
    }

    #[test]
    fn test_unreachable_socket_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = fork_request(
            &dir.path().join("missing.sock"),
            Path::new("/r"),
            "1",
            &[],
            true,
            Duration::from_secs(1),
        )
        .unwrap_err();

        assert!(matches!(err, CacheError::Io(_)));
    }
}
