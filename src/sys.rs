//! Thin libc wrappers used by the connection kinds.
//!
//! Everything here works on raw descriptors owned by the caller and reports
//! failures as `io::Error` built from errno.

use std::ffi::{CStr, CString};
use std::io::{self, Error, ErrorKind};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};

fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret < 0 {
        Err(Error::last_os_error())
    } else {
        Ok(ret)
    }
}

fn cpath(path: &Path) -> io::Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| Error::new(ErrorKind::InvalidInput, "path contains NUL byte"))
}

pub fn write_all(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    let mut written = 0usize;
    let mut remaining = buf;

    while !remaining.is_empty() {
        let ret = unsafe {
            libc::write(fd, remaining.as_ptr() as *const libc::c_void, remaining.len())
        };

        if ret == -1 {
            let err = Error::last_os_error();
            if err.kind() == ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }

        let n = ret as usize;
        written += n;
        remaining = &remaining[n..];
    }

    Ok(written)
}

/// Reads until `buf` is full or the peer closes. Returns the byte count.
pub fn read_all(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let mut total = 0usize;
    let mut remaining = buf;

    while !remaining.is_empty() {
        let ret = unsafe {
            libc::read(fd, remaining.as_mut_ptr() as *mut libc::c_void, remaining.len())
        };

        if ret == -1 {
            let err = Error::last_os_error();
            if err.kind() == ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }

        if ret == 0 {
            break;
        }

        let n = ret as usize;
        total += n;
        remaining = &mut remaining[n..];
    }

    Ok(total)
}

pub fn close(fd: RawFd) {
    unsafe { libc::close(fd) };
}

/// Installs `src` on every descriptor in `fds`, then closes `src` unless it
/// is one of them. `src` is closed on failure as well.
pub fn install_on(src: RawFd, fds: &[RawFd]) -> io::Result<()> {
    let result = fds.iter().filter(|&&fd| fd != src).try_for_each(|&fd| {
        let ret = cvt(unsafe { libc::dup2(src, fd) })?;
        if ret != fd {
            return Err(Error::new(ErrorKind::AddrInUse, "dup2 landed on wrong fd"));
        }
        Ok(())
    });
    if !fds.contains(&src) {
        close(src);
    }
    result
}

pub fn dup2(src: RawFd, dst: RawFd) -> io::Result<()> {
    cvt(unsafe { libc::dup2(src, dst) }).map(|_| ())
}

pub fn fcntl_get(fd: RawFd, cmd: libc::c_int) -> io::Result<libc::c_int> {
    cvt(unsafe { libc::fcntl(fd, cmd) })
}

pub fn fcntl_set(fd: RawFd, cmd: libc::c_int, arg: libc::c_int) -> io::Result<()> {
    cvt(unsafe { libc::fcntl(fd, cmd, arg) }).map(|_| ())
}

pub fn socket(domain: i32, ty: i32, protocol: i32) -> io::Result<RawFd> {
    cvt(unsafe { libc::socket(domain, ty, protocol) })
}

/// Binds to a raw `sockaddr` image as captured from the bind() call.
pub fn bind_raw(fd: RawFd, addr: &[u8]) -> io::Result<()> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let len = addr.len().min(std::mem::size_of::<libc::sockaddr_storage>());
    unsafe {
        std::ptr::copy_nonoverlapping(
            addr.as_ptr(),
            &mut storage as *mut libc::sockaddr_storage as *mut u8,
            len,
        );
    }
    cvt(unsafe {
        libc::bind(
            fd,
            &storage as *const libc::sockaddr_storage as *const libc::sockaddr,
            len as libc::socklen_t,
        )
    })
    .map(|_| ())
}

pub fn listen(fd: RawFd, backlog: i32) -> io::Result<()> {
    cvt(unsafe { libc::listen(fd, backlog) }).map(|_| ())
}

/// Returns the raw `sockaddr` the socket is bound to.
pub fn sock_name(fd: RawFd) -> io::Result<Vec<u8>> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    cvt(unsafe {
        libc::getsockname(
            fd,
            &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
            &mut len,
        )
    })?;
    let bytes = unsafe {
        std::slice::from_raw_parts(
            &storage as *const libc::sockaddr_storage as *const u8,
            len as usize,
        )
    };
    Ok(bytes.to_vec())
}

/// Raw `sockaddr_in`/`sockaddr_in6` image of a std socket address.
pub fn sockaddr_bytes(addr: &SocketAddr) -> Vec<u8> {
    fn as_bytes<T>(val: &T) -> Vec<u8> {
        let len = std::mem::size_of::<T>();
        unsafe { std::slice::from_raw_parts(val as *const T as *const u8, len) }.to_vec()
    }

    match addr {
        SocketAddr::V4(v4) => {
            let mut sin: libc::sockaddr_in = unsafe { std::mem::zeroed() };
            sin.sin_family = libc::AF_INET as libc::sa_family_t;
            sin.sin_port = v4.port().to_be();
            sin.sin_addr.s_addr = u32::from_ne_bytes(v4.ip().octets());
            as_bytes(&sin)
        }
        SocketAddr::V6(v6) => {
            let mut sin6: libc::sockaddr_in6 = unsafe { std::mem::zeroed() };
            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sin6.sin6_port = v6.port().to_be();
            sin6.sin6_flowinfo = v6.flowinfo();
            sin6.sin6_addr.s6_addr = v6.ip().octets();
            sin6.sin6_scope_id = v6.scope_id();
            as_bytes(&sin6)
        }
    }
}

/// Inverse of [`sockaddr_bytes`]; `None` for other address families.
pub fn sockaddr_to_std(raw: &[u8]) -> Option<SocketAddr> {
    if raw.len() < std::mem::size_of::<libc::sa_family_t>() {
        return None;
    }
    let family = libc::sa_family_t::from_ne_bytes([raw[0], raw[1]]) as libc::c_int;

    match family {
        libc::AF_INET if raw.len() >= std::mem::size_of::<libc::sockaddr_in>() => {
            let sin = unsafe { std::ptr::read_unaligned(raw.as_ptr() as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
            Some(SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(sin.sin_port))))
        }
        libc::AF_INET6 if raw.len() >= std::mem::size_of::<libc::sockaddr_in6>() => {
            let sin6 =
                unsafe { std::ptr::read_unaligned(raw.as_ptr() as *const libc::sockaddr_in6) };
            Some(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(sin6.sin6_addr.s6_addr),
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => None,
    }
}

pub fn set_sockopt_raw(fd: RawFd, level: i32, name: i32, val: &[u8]) -> io::Result<()> {
    let ret = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            val.as_ptr() as *const libc::c_void,
            val.len() as libc::socklen_t,
        )
    };
    if ret < 0 {
        let err = Error::last_os_error();
        log::error!("Can't set {}:{} (len {}): {}", level, name, val.len(), err);
        return Err(err);
    }
    Ok(())
}

#[inline]
pub fn restore_opt<T>(fd: RawFd, level: i32, name: i32, val: &T) -> io::Result<()> {
    let bytes = unsafe {
        std::slice::from_raw_parts(val as *const T as *const u8, std::mem::size_of::<T>())
    };
    set_sockopt_raw(fd, level, name, bytes)
}

pub fn get_sockopt_int(fd: RawFd, level: i32, name: i32) -> io::Result<i32> {
    let mut val: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    cvt(unsafe {
        libc::getsockopt(
            fd,
            level,
            name,
            &mut val as *mut libc::c_int as *mut libc::c_void,
            &mut len,
        )
    })?;
    Ok(val)
}

pub fn seek(fd: RawFd, offset: i64, whence: libc::c_int) -> io::Result<i64> {
    let ret = unsafe { libc::lseek(fd, offset as libc::off_t, whence) };
    if ret < 0 {
        Err(Error::last_os_error())
    } else {
        Ok(ret as i64)
    }
}

pub fn open_path(path: &Path, flags: libc::c_int) -> io::Result<RawFd> {
    let c_path = cpath(path)?;
    cvt(unsafe { libc::open(c_path.as_ptr(), flags) })
}

/// Path the kernel reports for a live descriptor.
pub fn fd_path(fd: RawFd) -> io::Result<PathBuf> {
    std::fs::read_link(format!("/proc/self/fd/{}", fd))
}

pub fn getpid() -> i32 {
    unsafe { libc::getpid() }
}

pub fn hostname() -> io::Result<String> {
    let mut buf = [0u8; 256];
    cvt(unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) })?;
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    Ok(String::from_utf8_lossy(&buf[..end]).into_owned())
}

/// Login name of the real user, falling back to `$USER`.
pub fn username() -> String {
    let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
    let mut buf = vec![0 as libc::c_char; 1024];
    let mut result: *mut libc::passwd = std::ptr::null_mut();

    let ret = unsafe {
        libc::getpwuid_r(libc::getuid(), &mut pwd, buf.as_mut_ptr(), buf.len(), &mut result)
    };
    if ret == 0 && !result.is_null() && !pwd.pw_name.is_null() {
        let name = unsafe { CStr::from_ptr(pwd.pw_name) };
        return name.to_string_lossy().into_owned();
    }
    std::env::var("USER").unwrap_or_default()
}

/// True when the caller may both write to and search `path`.
pub fn can_write_and_search(path: &Path) -> bool {
    match cpath(path) {
        Ok(c_path) => unsafe { libc::access(c_path.as_ptr(), libc::X_OK | libc::W_OK) == 0 },
        Err(_) => false,
    }
}

pub fn tcgetattr(fd: RawFd) -> io::Result<Vec<u8>> {
    let mut tio: libc::termios = unsafe { std::mem::zeroed() };
    cvt(unsafe { libc::tcgetattr(fd, &mut tio) })?;
    let bytes = unsafe {
        std::slice::from_raw_parts(
            &tio as *const libc::termios as *const u8,
            std::mem::size_of::<libc::termios>(),
        )
    };
    Ok(bytes.to_vec())
}

pub fn tcsetattr(fd: RawFd, raw: &[u8]) -> io::Result<()> {
    if raw.len() != std::mem::size_of::<libc::termios>() {
        return Err(Error::new(ErrorKind::InvalidData, "termios size mismatch"));
    }
    let mut tio: libc::termios = unsafe { std::mem::zeroed() };
    unsafe {
        std::ptr::copy_nonoverlapping(
            raw.as_ptr(),
            &mut tio as *mut libc::termios as *mut u8,
            raw.len(),
        );
    }
    cvt(unsafe { libc::tcsetattr(fd, libc::TCSANOW, &tio) }).map(|_| ())
}

/// Opens a new pseudoterminal master. Returns the master fd and the path of
/// its slave.
pub fn open_ptmx() -> io::Result<(RawFd, PathBuf)> {
    let fd = cvt(unsafe { libc::posix_openpt(libc::O_RDWR | libc::O_NOCTTY) })?;

    let setup = || -> io::Result<PathBuf> {
        cvt(unsafe { libc::grantpt(fd) })?;
        cvt(unsafe { libc::unlockpt(fd) })?;
        let mut buf = [0 as libc::c_char; 128];
        let ret = unsafe { libc::ptsname_r(fd, buf.as_mut_ptr(), buf.len()) };
        if ret != 0 {
            return Err(Error::from_raw_os_error(ret));
        }
        let name = unsafe { CStr::from_ptr(buf.as_ptr()) };
        Ok(PathBuf::from(name.to_string_lossy().into_owned()))
    };

    match setup() {
        Ok(slave) => Ok((fd, slave)),
        Err(e) => {
            close(fd);
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn socketpair() -> (RawFd, RawFd) {
        let mut fds = [0; 2];
        let ret =
            unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
        assert_eq!(ret, 0);
        (fds[0], fds[1])
    }

    #[test]
    fn test_write_read_all() {
        let (a, b) = socketpair();
        assert_eq!(write_all(a, b"hello").unwrap(), 5);
        close(a);

        let mut buf = [0u8; 16];
        let n = read_all(b, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");
        close(b);
    }

    #[test]
    fn test_restore_opt_invalid_socket() {
        let val: i32 = 1;
        assert!(restore_opt(-1, libc::SOL_SOCKET, libc::SO_REUSEADDR, &val).is_err());
    }

    #[test]
    fn test_restore_opt_valid_socket() {
        let sk = socket(libc::AF_UNIX, libc::SOCK_STREAM, 0).unwrap();
        let val: i32 = 1;
        restore_opt(sk, libc::SOL_SOCKET, libc::SO_REUSEADDR, &val).unwrap();
        assert_eq!(get_sockopt_int(sk, libc::SOL_SOCKET, libc::SO_REUSEADDR).unwrap(), 1);
        close(sk);
    }

    #[test]
    fn test_install_on_moves_descriptor() {
        let (a, b) = socketpair();
        let target = unsafe { libc::dup(b) };
        install_on(a, &[target]).unwrap();

        // target now carries the `a` end of the pair
        write_all(target, b"x").unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(read_all(b, &mut buf).unwrap(), 1);
        assert_eq!(&buf, b"x");
        close(target);
        close(b);
    }

    #[test]
    fn test_install_on_failure_closes_source() {
        let (a, b) = socketpair();
        assert!(install_on(a, &[-1]).is_err());

        // with `a` gone the other end reads EOF instead of EAGAIN
        let flags = fcntl_get(b, libc::F_GETFL).unwrap();
        fcntl_set(b, libc::F_SETFL, flags | libc::O_NONBLOCK).unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(read_all(b, &mut buf).unwrap(), 0);
        close(b);
    }

    #[test]
    fn test_sockaddr_bytes_binds() {
        let sk = socket(libc::AF_INET, libc::SOCK_STREAM, 0).unwrap();
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        bind_raw(sk, &sockaddr_bytes(&addr)).unwrap();

        let bound = sockaddr_to_std(&sock_name(sk).unwrap()).unwrap();
        assert_eq!(bound.ip(), addr.ip());
        assert_ne!(bound.port(), 0);
        close(sk);
    }

    #[test]
    fn test_sockaddr_v6_round_trip() {
        let addr: SocketAddr = "[::1]:8080".parse().unwrap();
        assert_eq!(sockaddr_to_std(&sockaddr_bytes(&addr)), Some(addr));
        assert_eq!(sockaddr_to_std(&[0u8; 1]), None);
    }

    #[test]
    fn test_hostname_not_empty() {
        assert!(!hostname().unwrap().is_empty());
    }
}
