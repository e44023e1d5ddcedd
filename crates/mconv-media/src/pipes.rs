//! Stdio descriptor allocation for the transcoder process.
//!
//! Descriptor 0 goes to the first stream-backed input and descriptor 1 to
//! the first stream-backed output. Descriptor 2 always stays the diagnostic
//! channel. Every other stream-backed endpoint gets the next descriptor from
//! 3 upwards, in declaration order.

use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

#[cfg(target_vendor = "apple")]
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use tokio::net::unix::pipe;
use tokio::process::Command;

/// Direction of a piped endpoint, seen from the transcoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeRole {
    /// The transcoder reads from the pipe
    Input,
    /// The transcoder writes to the pipe
    Output,
}

/// First descriptor handed out after stdin, stdout and stderr.
pub const FIRST_EXTRA_PIPE: u32 = 3;

/// Assign descriptors to endpoints given in declaration order.
///
/// `None` marks an endpoint that uses a path or URL and gets no pipe.
pub fn allocate_pipes(endpoints: &[Option<PipeRole>]) -> Vec<Option<u32>> {
    let mut stdin_taken = false;
    let mut stdout_taken = false;
    let mut next = FIRST_EXTRA_PIPE;

    endpoints
        .iter()
        .map(|role| match role {
            None => None,
            Some(PipeRole::Input) if !stdin_taken => {
                stdin_taken = true;
                Some(0)
            }
            Some(PipeRole::Output) if !stdout_taken => {
                stdout_taken = true;
                Some(1)
            }
            Some(_) => {
                let pipe = next;
                next += 1;
                Some(pipe)
            }
        })
        .collect()
}

/// Number of descriptors the child needs for `pipes`.
pub fn descriptor_table_size(pipes: &[Option<u32>]) -> usize {
    pipes
        .iter()
        .flatten()
        .map(|pipe| *pipe as usize + 1)
        .max()
        .unwrap_or(0)
        .max(3)
}

/// Parent side of an extra pipe.
#[derive(Debug)]
pub enum ParentEnd {
    Writer(pipe::Sender),
    Reader(pipe::Receiver),
}

/// A pipe destined for descriptor 3 or above in the child.
#[derive(Debug)]
pub struct ExtraPipe {
    pub target: u32,
    child_end: OwnedFd,
    parent: ParentEnd,
}

impl ExtraPipe {
    /// Create the pipe. Both ends are close-on-exec until the child moves
    /// its end into place.
    pub fn open(target: u32, role: PipeRole) -> io::Result<Self> {
        let (read, write) = cloexec_pipe()?;

        let (child_end, parent) = match role {
            PipeRole::Input => (read, ParentEnd::Writer(pipe::Sender::from_owned_fd(write)?)),
            PipeRole::Output => (write, ParentEnd::Reader(pipe::Receiver::from_owned_fd(read)?)),
        };

        Ok(Self {
            target,
            child_end,
            parent,
        })
    }

    /// `(current descriptor, descriptor in the child)`.
    pub fn mapping(&self) -> (RawFd, RawFd) {
        (self.child_end.as_raw_fd(), self.target as RawFd)
    }

    /// Close the child end in this process and keep the parent end.
    pub fn into_parent(self) -> ParentEnd {
        drop(self.child_end);
        self.parent
    }
}

/// A pipe whose ends are close-on-exec from the start, so a child spawned
/// concurrently by another conversion never inherits them.
#[cfg(not(target_vendor = "apple"))]
fn cloexec_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    Ok(nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC)?)
}

// No pipe2 here; the flag is set right after creation.
#[cfg(target_vendor = "apple")]
fn cloexec_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let (read, write) = nix::unistd::pipe()?;
    for fd in [&read, &write] {
        fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
    }
    Ok((read, write))
}

/// Set the absolute niceness of process `pid`, or of the calling process
/// when `pid` is 0.
pub fn set_niceness(pid: u32, niceness: i32) -> io::Result<()> {
    // SAFETY: setpriority only reads its integer arguments.
    let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS, pid as libc::id_t, niceness) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Move extra pipes to their target descriptors and lower the scheduling
/// priority of the child before it execs.
pub fn configure_child(command: &mut Command, mappings: Vec<(RawFd, RawFd)>, niceness: Option<i32>) {
    if mappings.is_empty() && niceness.is_none() {
        return;
    }

    let floor = mappings
        .iter()
        .map(|(source, target)| (*source).max(*target))
        .max()
        .unwrap_or(2)
        + 1;
    let mut moved = vec![-1 as RawFd; mappings.len()];

    // SAFETY: the hook runs in the forked child before exec. It only calls
    // async-signal-safe libc functions and writes into memory allocated
    // before the fork.
    unsafe {
        command.pre_exec(move || {
            // First lift every source above all targets so the second pass
            // cannot overwrite a source that is still needed.
            for (slot, (source, _)) in moved.iter_mut().zip(&mappings) {
                let fd = libc::fcntl(*source, libc::F_DUPFD, floor);
                if fd < 0 {
                    return Err(io::Error::last_os_error());
                }
                *slot = fd;
            }

            for (fd, (_, target)) in moved.iter().zip(&mappings) {
                if libc::dup2(*fd, *target) < 0 {
                    return Err(io::Error::last_os_error());
                }
                libc::close(*fd);
            }

            if let Some(niceness) = niceness {
                // On failure the child keeps the inherited niceness
                let _ = set_niceness(0, niceness);
            }

            Ok(())
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use PipeRole::{Input, Output};

    #[test]
    fn test_single_input_and_output() {
        assert_eq!(allocate_pipes(&[Some(Input), Some(Output)]), vec![Some(0), Some(1)]);
        assert_eq!(allocate_pipes(&[Some(Output), Some(Input)]), vec![Some(1), Some(0)]);
    }

    #[test]
    fn test_paths_get_no_pipe() {
        assert_eq!(
            allocate_pipes(&[None, Some(Input), None, Some(Output)]),
            vec![None, Some(0), None, Some(1)]
        );
    }

    #[test]
    fn test_extra_pipes_follow_declaration_order() {
        let pipes = allocate_pipes(&[
            Some(Input),
            Some(Output),
            Some(Input),
            Some(Output),
            Some(Output),
        ]);
        assert_eq!(pipes, vec![Some(0), Some(1), Some(3), Some(4), Some(5)]);
        assert_eq!(descriptor_table_size(&pipes), 6);
    }

    #[test]
    fn test_outputs_without_piped_inputs() {
        let pipes = allocate_pipes(&[None, Some(Output), Some(Output)]);
        assert_eq!(pipes, vec![None, Some(1), Some(3)]);
        assert_eq!(descriptor_table_size(&[None, Some(1)]), 3);
    }

    #[test]
    fn test_pipe_ends_are_close_on_exec() {
        let (read, write) = cloexec_pipe().unwrap();
        for fd in [&read, &write] {
            let flags = nix::fcntl::fcntl(fd, nix::fcntl::FcntlArg::F_GETFD).unwrap();
            assert!(nix::fcntl::FdFlag::from_bits_truncate(flags).contains(nix::fcntl::FdFlag::FD_CLOEXEC));
        }
    }

    #[tokio::test]
    async fn test_extra_pipe_mapping() {
        let pipe = ExtraPipe::open(4, Output).unwrap();
        let (source, target) = pipe.mapping();
        assert!(source >= 0);
        assert_eq!(target, 4);
        assert!(matches!(pipe.into_parent(), ParentEnd::Reader(_)));
    }
}
