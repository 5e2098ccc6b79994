use std::iter::Peekable;

use miniarg::split_args::SplitArgs;

pub type ParseStream<'a> = Peekable<SplitArgs<'a>>;

pub fn parse_stream(s: &str) -> ParseStream<'_> {
    SplitArgs::new(s).peekable()
}

pub trait Parse {
    type Output;
    type Error;

    fn parse(stream: &mut ParseStream<'_>) -> Result<Self::Output, Self::Error>;
}

/// Consumes the arguments of an option nobody recognised, up to the next
/// option flag.
pub fn take_values(stream: &mut ParseStream<'_>) -> Vec<String> {
    let mut values = Vec::new();

    while let Some(x) = stream.next_if(|x| !x.starts_with('-') && *x != "!") {
        values.push(x.to_owned());
    }

    values
}
