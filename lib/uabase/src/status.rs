use std::error;
use std::fmt;

/// OPC UA status code. The upper 16 bits carry the code itself, the severity
/// lives in the two topmost bits (`00` good, `01` uncertain, `10` bad).
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Hash)]
pub struct StatusCode(pub u32);

macro_rules! status_codes {
    ($($name:ident = $value:expr, $label:expr;)*) => {
        impl StatusCode {
            $(pub const $name: StatusCode = StatusCode($value);)*

            /// The symbolic name of the code, or `"Unknown"` for codes
            /// outside the table.
            pub fn name(self) -> &'static str {
                match self {
                    $(StatusCode::$name => $label,)*
                    _ => "Unknown",
                }
            }
        }
    };
}

status_codes! {
    GOOD = 0x0000_0000, "Good";
    BAD_UNEXPECTED_ERROR = 0x8001_0000, "BadUnexpectedError";
    BAD_INTERNAL_ERROR = 0x8002_0000, "BadInternalError";
    BAD_OUT_OF_MEMORY = 0x8003_0000, "BadOutOfMemory";
    BAD_RESOURCE_UNAVAILABLE = 0x8004_0000, "BadResourceUnavailable";
    BAD_COMMUNICATION_ERROR = 0x8005_0000, "BadCommunicationError";
    BAD_ENCODING_ERROR = 0x8006_0000, "BadEncodingError";
    BAD_DECODING_ERROR = 0x8007_0000, "BadDecodingError";
    BAD_ENCODING_LIMITS_EXCEEDED = 0x8008_0000, "BadEncodingLimitsExceeded";
    BAD_TIMEOUT = 0x800A_0000, "BadTimeout";
    BAD_SERVICE_UNSUPPORTED = 0x800B_0000, "BadServiceUnsupported";
    BAD_SHUTDOWN = 0x800C_0000, "BadShutdown";
    BAD_CERTIFICATE_INVALID = 0x8012_0000, "BadCertificateInvalid";
    BAD_SECURITY_CHECKS_FAILED = 0x8013_0000, "BadSecurityChecksFailed";
    BAD_CERTIFICATE_TIME_INVALID = 0x8014_0000, "BadCertificateTimeInvalid";
    BAD_CERTIFICATE_ISSUER_TIME_INVALID = 0x8015_0000, "BadCertificateIssuerTimeInvalid";
    BAD_CERTIFICATE_HOST_NAME_INVALID = 0x8016_0000, "BadCertificateHostNameInvalid";
    BAD_CERTIFICATE_URI_INVALID = 0x8017_0000, "BadCertificateUriInvalid";
    BAD_CERTIFICATE_USE_NOT_ALLOWED = 0x8018_0000, "BadCertificateUseNotAllowed";
    BAD_CERTIFICATE_ISSUER_USE_NOT_ALLOWED = 0x8019_0000, "BadCertificateIssuerUseNotAllowed";
    BAD_CERTIFICATE_UNTRUSTED = 0x801A_0000, "BadCertificateUntrusted";
    BAD_CERTIFICATE_REVOCATION_UNKNOWN = 0x801B_0000, "BadCertificateRevocationUnknown";
    BAD_CERTIFICATE_ISSUER_REVOCATION_UNKNOWN = 0x801C_0000, "BadCertificateIssuerRevocationUnknown";
    BAD_CERTIFICATE_REVOKED = 0x801D_0000, "BadCertificateRevoked";
    BAD_CERTIFICATE_ISSUER_REVOKED = 0x801E_0000, "BadCertificateIssuerRevoked";
    BAD_SECURE_CHANNEL_ID_INVALID = 0x8022_0000, "BadSecureChannelIdInvalid";
    BAD_INVALID_TIMESTAMP = 0x8023_0000, "BadInvalidTimestamp";
    BAD_NONCE_INVALID = 0x8024_0000, "BadNonceInvalid";
    BAD_NOT_FOUND = 0x803E_0000, "BadNotFound";
    BAD_NOT_IMPLEMENTED = 0x8040_0000, "BadNotImplemented";
    BAD_SECURITY_MODE_REJECTED = 0x8054_0000, "BadSecurityModeRejected";
    BAD_SECURITY_POLICY_REJECTED = 0x8055_0000, "BadSecurityPolicyRejected";
    BAD_SEQUENCE_NUMBER_UNKNOWN = 0x807A_0000, "BadSequenceNumberUnknown";
    BAD_TCP_SERVER_TOO_BUSY = 0x807D_0000, "BadTcpServerTooBusy";
    BAD_TCP_MESSAGE_TYPE_INVALID = 0x807E_0000, "BadTcpMessageTypeInvalid";
    BAD_TCP_SECURE_CHANNEL_UNKNOWN = 0x807F_0000, "BadTcpSecureChannelUnknown";
    BAD_TCP_MESSAGE_TOO_LARGE = 0x8080_0000, "BadTcpMessageTooLarge";
    BAD_TCP_NOT_ENOUGH_RESOURCES = 0x8081_0000, "BadTcpNotEnoughResources";
    BAD_TCP_INTERNAL_ERROR = 0x8082_0000, "BadTcpInternalError";
    BAD_TCP_ENDPOINT_URL_INVALID = 0x8083_0000, "BadTcpEndpointUrlInvalid";
    BAD_SECURE_CHANNEL_CLOSED = 0x8086_0000, "BadSecureChannelClosed";
    BAD_SECURE_CHANNEL_TOKEN_UNKNOWN = 0x8087_0000, "BadSecureChannelTokenUnknown";
    BAD_SEQUENCE_NUMBER_INVALID = 0x8088_0000, "BadSequenceNumberInvalid";
    BAD_CONFIGURATION_ERROR = 0x8089_0000, "BadConfigurationError";
    BAD_INVALID_ARGUMENT = 0x80AB_0000, "BadInvalidArgument";
    BAD_CONNECTION_REJECTED = 0x80AC_0000, "BadConnectionRejected";
    BAD_DISCONNECT = 0x80AD_0000, "BadDisconnect";
    BAD_CONNECTION_CLOSED = 0x80AE_0000, "BadConnectionClosed";
    BAD_INVALID_STATE = 0x80AF_0000, "BadInvalidState";
    BAD_REQUEST_TOO_LARGE = 0x80B8_0000, "BadRequestTooLarge";
    BAD_RESPONSE_TOO_LARGE = 0x80B9_0000, "BadResponseTooLarge";
}

impl StatusCode {
    #[inline]
    pub fn is_good(self) -> bool {
        self.0 & 0xC000_0000 == 0
    }

    #[inline]
    pub fn is_bad(self) -> bool {
        self.0 & 0x8000_0000 != 0
    }

    /// True for the certificate-class codes that must not leave the process
    /// in an ERR message.
    pub fn is_certificate_error(self) -> bool {
        matches!(
            self,
            StatusCode::BAD_CERTIFICATE_INVALID
                | StatusCode::BAD_CERTIFICATE_TIME_INVALID
                | StatusCode::BAD_CERTIFICATE_ISSUER_TIME_INVALID
                | StatusCode::BAD_CERTIFICATE_HOST_NAME_INVALID
                | StatusCode::BAD_CERTIFICATE_URI_INVALID
                | StatusCode::BAD_CERTIFICATE_USE_NOT_ALLOWED
                | StatusCode::BAD_CERTIFICATE_ISSUER_USE_NOT_ALLOWED
                | StatusCode::BAD_CERTIFICATE_UNTRUSTED
                | StatusCode::BAD_CERTIFICATE_REVOCATION_UNKNOWN
                | StatusCode::BAD_CERTIFICATE_ISSUER_REVOCATION_UNKNOWN
                | StatusCode::BAD_CERTIFICATE_REVOKED
                | StatusCode::BAD_CERTIFICATE_ISSUER_REVOKED
        )
    }

    /// Maps the code to what may be sent to the peer in an ERR message.
    /// Certificate-related codes collapse to `BadSecurityChecksFailed` so
    /// the peer cannot probe the trust configuration.
    pub fn sanitized(self) -> StatusCode {
        if self.is_certificate_error() {
            StatusCode::BAD_SECURITY_CHECKS_FAILED
        } else {
            self
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} (0x{:08X})", self.name(), self.0)
    }
}

impl error::Error for StatusCode {}

impl From<StatusCode> for u32 {
    #[inline]
    fn from(code: StatusCode) -> u32 {
        code.0
    }
}

impl From<u32> for StatusCode {
    #[inline]
    fn from(raw: u32) -> StatusCode {
        StatusCode(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity() {
        assert!(StatusCode::GOOD.is_good());
        assert!(!StatusCode::GOOD.is_bad());
        assert!(StatusCode::BAD_INTERNAL_ERROR.is_bad());
        assert!(!StatusCode::BAD_INTERNAL_ERROR.is_good());
    }

    #[test]
    fn test_names() {
        assert_eq!(StatusCode::BAD_SECURITY_CHECKS_FAILED.name(), "BadSecurityChecksFailed");
        assert_eq!(StatusCode(0xDEAD_0000).name(), "Unknown");
    }

    #[test]
    fn test_sanitized_hides_certificate_codes() {
        assert_eq!(
            StatusCode::BAD_CERTIFICATE_UNTRUSTED.sanitized(),
            StatusCode::BAD_SECURITY_CHECKS_FAILED
        );
        assert_eq!(
            StatusCode::BAD_CERTIFICATE_REVOKED.sanitized(),
            StatusCode::BAD_SECURITY_CHECKS_FAILED
        );
        assert_eq!(
            StatusCode::BAD_CERTIFICATE_ISSUER_REVOCATION_UNKNOWN.sanitized(),
            StatusCode::BAD_SECURITY_CHECKS_FAILED
        );
    }

    #[test]
    fn test_sanitized_passes_transport_codes() {
        assert_eq!(
            StatusCode::BAD_COMMUNICATION_ERROR.sanitized(),
            StatusCode::BAD_COMMUNICATION_ERROR
        );
        assert_eq!(StatusCode::BAD_TIMEOUT.sanitized(), StatusCode::BAD_TIMEOUT);
    }

    #[test]
    fn test_display() {
        let text = format!("{}", StatusCode::BAD_DECODING_ERROR);
        assert_eq!(text, "BadDecodingError (0x80070000)");
    }
}
