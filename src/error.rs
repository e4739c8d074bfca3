/// Turns a `Result` into an `Option`, logging the error instead of propagating it.
///
/// Used where the agent keeps running after a failure, e.g. cleaning up a socket file or
/// serializing a telemetry snapshot.
pub trait ResultOkLogExt<T> {
    fn ok_log(self) -> Option<T>;
}

impl<T, E> ResultOkLogExt<T> for std::result::Result<T, E>
where
    E: std::error::Error,
{
    fn ok_log(self) -> Option<T> {
        match self {
            Ok(ok) => Some(ok),
            Err(err) => {
                match err.source() {
                    Some(source) => log::error!("{err} (caused by: {source})"),
                    None => log::error!("{err}"),
                }
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ok_log() {
        let ok: Result<u8, std::io::Error> = Ok(3);
        assert_eq!(ok.ok_log(), Some(3));

        let err: Result<u8, std::io::Error> = Err(std::io::Error::other("boom"));
        assert_eq!(err.ok_log(), None);
    }
}
