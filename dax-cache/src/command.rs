//! # Command Forwarding
//!
//! Commands are plain name + argument lists. Nothing here knows which
//! commands exist; the server is the only authority on that.

use std::borrow::Cow;

use dax_common::DaxResult;

use crate::value::CacheValue;

/// Serializes a value as one command argument.
pub trait ToArg {
    fn write_arg(&self, out: &mut Vec<u8>);
}

impl ToArg for str {
    fn write_arg(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.as_bytes());
    }
}

impl ToArg for String {
    fn write_arg(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.as_bytes());
    }
}

impl ToArg for [u8] {
    fn write_arg(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self);
    }
}

impl ToArg for Vec<u8> {
    fn write_arg(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self);
    }
}

impl<const N: usize> ToArg for [u8; N] {
    fn write_arg(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self);
    }
}

macro_rules! impl_to_arg_display {
    ($($ty:ty),*) => {
        $(
            impl ToArg for $ty {
                fn write_arg(&self, out: &mut Vec<u8>) {
                    out.extend_from_slice(self.to_string().as_bytes());
                }
            }
        )*
    };
}

impl_to_arg_display!(i8, i16, i32, i64, isize, u8, u16, u32, u64, usize, f32, f64);

impl<T: ToArg + ?Sized> ToArg for &T {
    fn write_arg(&self, out: &mut Vec<u8>) {
        (**self).write_arg(out);
    }
}

/// A command name plus its encoded arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    parts: Vec<Vec<u8>>,
}

impl Command {
    pub fn new(name: &str) -> Self {
        Command {
            parts: vec![name.as_bytes().to_vec()],
        }
    }

    pub fn arg<A: ToArg>(mut self, arg: A) -> Self {
        self.push_arg(arg);
        self
    }

    pub fn push_arg<A: ToArg>(&mut self, arg: A) -> &mut Self {
        let mut buf = Vec::new();
        arg.write_arg(&mut buf);
        self.parts.push(buf);
        self
    }

    pub fn name(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.parts[0])
    }

    /// Name followed by arguments, as sent on the wire.
    pub fn parts(&self) -> &[Vec<u8>] {
        &self.parts
    }

    /// Sends the command through `target`.
    pub fn query<T: Dispatch + ?Sized>(&self, target: &T) -> DaxResult<CacheValue> {
        target.dispatch(self)
    }
}

/// Shorthand for [`Command::new`].
pub fn cmd(name: &str) -> Command {
    Command::new(name)
}

/// Anything that can forward a command to the cache backend.
pub trait Dispatch {
    fn dispatch(&self, command: &Command) -> DaxResult<CacheValue>;

    /// Forwards `name` with `args` and returns the reply unmodified.
    ///
    /// Each call runs on whichever pooled connection is free, so state set
    /// by one call is not visible to the next. Connections that ran a
    /// session-state command (`SELECT`, `MULTI`, `SUBSCRIBE`, `CLIENT
    /// SETNAME`, ...) are closed rather than reused.
    fn call(&self, name: &str, args: &[&dyn ToArg]) -> DaxResult<CacheValue> {
        let mut command = Command::new(name);
        for arg in args {
            command.push_arg(arg);
        }
        self.dispatch(&command)
    }

    /// Starts a command bound to this target.
    fn cmd(&self, name: &str) -> Call<'_, Self>
    where
        Self: Sized,
    {
        Call {
            target: self,
            command: Command::new(name),
        }
    }
}

/// Builder returned by [`Dispatch::cmd`].
pub struct Call<'a, T: Dispatch> {
    target: &'a T,
    command: Command,
}

impl<T: Dispatch> Call<'_, T> {
    pub fn arg<A: ToArg>(mut self, arg: A) -> Self {
        self.command.push_arg(arg);
        self
    }

    pub fn query(self) -> DaxResult<CacheValue> {
        self.target.dispatch(&self.command)
    }
}
