use std::fmt::{Display, Formatter, Result};

use owo_colors::OwoColorize;

#[doc(hidden)]
#[expect(non_camel_case_types)]
pub struct _display<'a, T: ?Sized>(pub &'a T);

impl<'a, T> Display for _display<'a, &T>
where
    _display<'a, T>: Display,
{
    #[inline]
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        _display(*self.0).fmt(f)
    }
}

macro_rules! display {
    ($x:expr) => {{ $crate::display::_display(&$x) }};
}

impl Display for _display<'_, std::io::Error> {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        self.0.bright_red().fmt(f)
    }
}

impl Display for _display<'_, std::net::Ipv4Addr> {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        self.0.bright_yellow().fmt(f)
    }
}

impl Display for _display<'_, u16> {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        self.0.bright_cyan().fmt(f)
    }
}

impl Display for _display<'_, crate::host::HostId> {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        self.0.bright_yellow().fmt(f)
    }
}

impl Display for _display<'_, crate::allocation::PortsPerHost> {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        self.0.bright_cyan().fmt(f)
    }
}
