//! Typed parsing of inbound solver-server protocol lines.
//!
//! The server speaks one directive or status per line. This module turns
//! a raw line into a [`ServerLine`] variant; the reader decides what each
//! variant means for its state.

use solverbench_core::canonical_model_name;

/// A recognized inbound protocol line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerLine {
    /// `... Listening on port ...` -- the server accepts connections.
    Listening,
    /// `... LINE READY ...` -- the per-connection handshake is complete.
    Ready,
    /// `... LINE STOP ...` -- the server is stopping.
    Stopping,
    /// `... MODEL <name> [...] <status>` -- a model changed state.
    ///
    /// `model` is the canonical model file name (result-file suffix
    /// stripped); `status` is the trailing status token.
    ModelStatus { model: String, status: String },
    /// A line that names a model but cannot be tokenized into a status.
    Malformed,
    /// Anything else; ignored by the reader.
    Other,
}

/// Parse one raw line from the server stream.
pub fn parse_line(line: &str) -> ServerLine {
    if line.contains("MODEL") {
        return parse_model_status(line);
    }
    if line.contains("Listening on port") {
        return ServerLine::Listening;
    }
    if line.contains("LINE READY") {
        return ServerLine::Ready;
    }
    if line.contains("LINE STOP") {
        return ServerLine::Stopping;
    }
    ServerLine::Other
}

/// Tokenize a MODEL status line.
///
/// Whitespace runs are collapsed by the tokenizer; token 1 is the model
/// name as the server reports it and the status is the final token.
fn parse_model_status(line: &str) -> ServerLine {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.len() < 3 {
        return ServerLine::Malformed;
    }
    let model = canonical_model_name(tokens[1]);
    // split_whitespace never yields empty tokens, so the last one is the
    // non-empty trailing status.
    let status = match tokens.last() {
        Some(status) => (*status).to_string(),
        None => return ServerLine::Malformed,
    };
    ServerLine::ModelStatus { model, status }
}

/// Status token marking a model as accepted; everything else is terminal.
pub const STATUS_SUBMITTED: &str = "SUBMITTED";

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn listening_line_recognized() {
        assert_eq!(
            parse_line("server v2.1 Listening on port 5463"),
            ServerLine::Listening
        );
    }

    #[test]
    fn ready_and_stop_lines_recognized() {
        assert_eq!(parse_line("LINE READY"), ServerLine::Ready);
        assert_eq!(parse_line("shutting down: LINE STOP"), ServerLine::Stopping);
    }

    #[test]
    fn submitted_status_strips_result_suffix() {
        let parsed = parse_line("MODEL A_res.xml QUEUED SUBMITTED");
        assert_eq!(
            parsed,
            ServerLine::ModelStatus {
                model: "A.xml".to_string(),
                status: "SUBMITTED".to_string(),
            }
        );
    }

    #[test]
    fn terminal_status_takes_trailing_token() {
        let parsed = parse_line("MODEL A_res.xml QUEUED DONE");
        assert_matches!(
            parsed,
            ServerLine::ModelStatus { model, status } if model == "A.xml" && status == "DONE"
        );
    }

    #[test]
    fn whitespace_runs_are_normalized() {
        let parsed = parse_line("  MODEL   B_res.xml    PROCESSED  ");
        assert_matches!(
            parsed,
            ServerLine::ModelStatus { model, status } if model == "B.xml" && status == "PROCESSED"
        );
    }

    #[test]
    fn three_token_line_uses_third_token_as_status() {
        let parsed = parse_line("MODEL C_res.xml SUBMITTED");
        assert_matches!(
            parsed,
            ServerLine::ModelStatus { model, status } if model == "C.xml" && status == "SUBMITTED"
        );
    }

    #[test]
    fn short_model_line_is_malformed() {
        assert_eq!(parse_line("MODEL only"), ServerLine::Malformed);
        assert_eq!(parse_line("MODEL"), ServerLine::Malformed);
    }

    #[test]
    fn unrelated_chatter_is_other() {
        assert_eq!(parse_line("starting worker threads"), ServerLine::Other);
        assert_eq!(parse_line(""), ServerLine::Other);
    }
}
