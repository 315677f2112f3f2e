/// The identity a channel is registered under with a selector.
///
/// `Token` is the value stored in the kernel-side registration and the
/// key of the event loop's channel table; the selector hands it back
/// with every readiness event so the loop can find the channel the
/// event belongs to. Tokens are allocated by the owning loop and never
/// reused within its lifetime.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Token(pub usize);

impl From<Token> for usize {
    fn from(val: Token) -> usize {
        val.0
    }
}

impl From<usize> for Token {
    fn from(val: usize) -> Token {
        Token(val)
    }
}
