//! Declarative helpers for protocol tables (command types, versions, error codes).

/// Generates the `CommandType` enum together with numeric conversions.
macro_rules! define_command_type {
    ($($name:ident = $val:expr),* $(,)?) => {
        /// Tuya command codes carried in the `commandType` header field.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u32)]
        pub enum CommandType {
            $($name = $val),*
        }

        impl CommandType {
            /// Looks up a command by its wire value.
            pub fn from_u32(value: u32) -> Option<Self> {
                match value {
                    $(v if v == $val => Some(CommandType::$name),)*
                    _ => None,
                }
            }

            pub fn as_u32(self) -> u32 {
                self as u32
            }
        }

        impl From<CommandType> for u32 {
            fn from(cmd: CommandType) -> u32 {
                cmd as u32
            }
        }
    };
}

/// Generates the `Version` enum with string/float accessors and parsing.
macro_rules! define_version {
    ($($name:ident = ($s:literal, $v:literal)),* $(,)?) => {
        /// Tuya LAN protocol version.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Version {
            $($name),*
        }

        impl Version {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Version::$name => $s,)*
                }
            }

            pub fn val(&self) -> f32 {
                match self {
                    $(Version::$name => $v,)*
                }
            }

            pub fn as_bytes(&self) -> &'static [u8] {
                self.as_str().as_bytes()
            }
        }

        impl std::fmt::Display for Version {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for Version {
            type Err = $crate::error::TuyaError;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                match s.trim() {
                    $($s => Ok(Version::$name),)*
                    other => Err($crate::error::TuyaError::UnsupportedVersion(other.to_string())),
                }
            }
        }
    };
}

/// Generates numeric error-code constants and `get_error_message`.
macro_rules! define_error_codes {
    ($($name:ident = $code:literal => $msg:literal),* $(,)?) => {
        $(pub const $name: u32 = $code;)*

        /// Human readable description for a numeric error code.
        pub fn get_error_message(code: u32) -> &'static str {
            match code {
                $($code => $msg,)*
                _ => "Unknown Error",
            }
        }
    };
}
