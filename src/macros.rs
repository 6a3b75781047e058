macro_rules! enum_with_unknown {
    (
        $( #[$enum_attr:meta] )*
        pub enum $name:ident($ty:ty) {
            $( $variant:ident = $value:expr ),+ $(,)?
        }
    ) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        $( #[$enum_attr] )*
        pub enum $name {
            $( $variant ),+,
            Unknown($ty)
        }

        impl ::core::convert::From<$ty> for $name {
            fn from(value: $ty) -> Self {
                match value {
                    $( $value => $name::$variant ),+,
                    other => $name::Unknown(other)
                }
            }
        }

        impl ::core::convert::From<$name> for $ty {
            fn from(value: $name) -> Self {
                match value {
                    $( $name::$variant => $value ),+,
                    $name::Unknown(other) => other
                }
            }
        }
    }
}

macro_rules! net_trace {
    ($($arg:expr),*) => { log::trace!($($arg),*) }
}

macro_rules! net_debug {
    ($($arg:expr),*) => { log::debug!($($arg),*) }
}

#[allow(unused_macros)]
macro_rules! net_log {
    ($level:ident, $($arg:expr),*) => { log::$level!($($arg),*) }
}
