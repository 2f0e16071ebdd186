use std::io::Write;
use std::os::fd::{AsRawFd, FromRawFd};

#[skein::start]
fn main() {
    let mut stdout = unsafe { skein::fs::File::from_raw_fd(std::io::stdout().as_raw_fd()) };

    stdout.write_all(b"hello world").unwrap();
}
