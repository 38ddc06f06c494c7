/// Anything the server writes back to a client as a complete reply: protocol
/// responses and parsing errors alike.
pub trait BeanstalkSerialisable {
    /// Renders the reply in wire format, including its trailing CRLF and any
    /// data block.
    fn serialise_beanstalk(&self) -> Vec<u8>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::ParsingError;
    use crate::types::protocol::BeanstalkResponse;

    #[test]
    fn test_replies_end_in_crlf() {
        let replies: &[&dyn BeanstalkSerialisable] = &[
            &ParsingError::BadFormat,
            &ParsingError::UnknownCommand,
            &BeanstalkResponse::TimedOut,
            &BeanstalkResponse::OkListTubes {
                tubes: vec!["default".into()],
            },
        ];

        for reply in replies {
            assert!(reply.serialise_beanstalk().ends_with(b"\r\n"));
        }
    }
}
