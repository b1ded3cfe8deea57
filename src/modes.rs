//! Integer "mode" fields from the alarm extended config.
//!
//! Sleep as Android packs two meanings into one integer: negative (and a few
//! small) values are named sentinels like DEFAULT or DISABLED, everything else
//! is a literal parameter (seconds, minutes, a snooze count). [`Mode`] keeps the
//! two apart so a literal 0 and a DISABLED sentinel never compare equal by
//! accident.

use std::fmt;

use serde::{Serialize, Serializer};

use crate::payload::DecodeError;

/// A closed set of named sentinel values for one mode field.
pub trait SentinelKind: Copy + Eq + fmt::Debug + 'static {
    /// Every sentinel of this kind.
    const ALL: &'static [Self];
    /// Inclusive integer range decoded as `Mode::Literal`, if the field has one.
    const LITERAL: Option<(i64, i64)>;

    fn code(self) -> i64;
    fn name(self) -> &'static str;

    fn from_code(code: i64) -> Option<Self> {
        Self::ALL.iter().copied().find(|kind| kind.code() == code)
    }
}

/// Either a named sentinel or a literal numeric parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode<S> {
    Sentinel(S),
    Literal(u32),
}

impl<S: SentinelKind> Mode<S> {
    /// Decode `code` for `field`. Sentinels win over literals; anything that
    /// is neither is rejected rather than coerced.
    pub fn decode(field: &str, code: i64) -> Result<Self, DecodeError> {
        if let Some(kind) = S::from_code(code) {
            return Ok(Mode::Sentinel(kind));
        }
        match S::LITERAL {
            Some((low, high)) if (low..=high).contains(&code) => u32::try_from(code)
                .map(Mode::Literal)
                .map_err(|_| DecodeError::UnknownMode {
                    field: field.to_string(),
                    value: code,
                }),
            _ => Err(DecodeError::UnknownMode {
                field: field.to_string(),
                value: code,
            }),
        }
    }
}

/// Sentinels serialize by name, literals as plain numbers.
impl<S: SentinelKind> Serialize for Mode<S> {
    fn serialize<Ser: Serializer>(&self, serializer: Ser) -> Result<Ser::Ok, Ser::Error> {
        match self {
            Mode::Sentinel(kind) => serializer.serialize_str(kind.name()),
            Mode::Literal(n) => serializer.serialize_u32(*n),
        }
    }
}

const NON_NEGATIVE: Option<(i64, i64)> = Some((0, u32::MAX as i64));
const POSITIVE: Option<(i64, i64)> = Some((1, u32::MAX as i64));

macro_rules! sentinel_kind {
    (
        $(#[$meta:meta])*
        $name:ident, literal: $literal:expr,
        { $($variant:ident = $code:expr => $label:literal),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant),+
        }

        impl SentinelKind for $name {
            const ALL: &'static [Self] = &[$(Self::$variant),+];
            const LITERAL: Option<(i64, i64)> = $literal;

            fn code(self) -> i64 {
                match self {
                    $(Self::$variant => $code,)+
                }
            }

            fn name(self) -> &'static str {
                match self {
                    $(Self::$variant => $label,)+
                }
            }
        }
    };
}

sentinel_kind! {
    /// `gradualVolumeIncrease`; literal = ramp-up seconds.
    VolumeIncreaseKind, literal: NON_NEGATIVE, {
        Default = -2 => "DEFAULT",
        Disabled = -1 => "DISABLED",
    }
}

sentinel_kind! {
    /// `snoozeAfterAlarm`; flag only.
    SnoozeAfterAlarmKind, literal: None, {
        Default = -2 => "DEFAULT",
        Disabled = 0 => "DISABLED",
        Enabled = 1 => "ENABLED",
    }
}

sentinel_kind! {
    /// `snoozeDuration` and `snoozeTotalTimeLimit`; literal = minutes.
    SnoozeDurationKind, literal: POSITIVE, {
        Default = -2 => "DEFAULT",
        LastUsed = -1 => "LAST_USED",
        Disabled = 0 => "DISABLED",
    }
}

sentinel_kind! {
    /// `snoozeLimit`; literal = number of snoozes allowed.
    SnoozeLimitKind, literal: Some((1, 5)), {
        Default = -2 => "DEFAULT",
        NoLimit = 0 => "NO_LIMIT",
    }
}

sentinel_kind! {
    /// `soundDelay`; literal = seconds before the sound starts.
    DelayedStartKind, literal: NON_NEGATIVE, {
        Default = -2 => "DEFAULT",
        FromStart = -1 => "FROM_START",
    }
}

sentinel_kind! {
    /// `vibrationStart` / `vibrationStartSmartWatch`; literal = delay seconds.
    VibrateKind, literal: POSITIVE, {
        Default = -2 => "DEFAULT",
        Disabled = -1 => "DISABLED",
        FromStart = 0 => "FROM_START",
    }
}

sentinel_kind! {
    /// Wake-up task required to dismiss the alarm.
    CaptchaKind, literal: None, {
        Default = -1 => "DEFAULT",
        Disabled = 0 => "DISABLED",
        SimpleMath = 1 => "SIMPLE_MATH",
        TypedMath = 2 => "TYPED_MATH",
        SleepingSheep = 3 => "SLEEPING_SHEEP",
        QrBarcode = 4 => "QR_BARCODE",
        NfcTag = 5 => "NFC_TAG",
        ShakeIt = 6 => "SHAKE_IT",
        DreamDiary = 7 => "DREAM_DIARY",
        SayCheese = 8 => "SAY_CHEESE",
        LaughOutLoud = 9 => "LAUGH_OUT_LOUD",
    }
}

sentinel_kind! {
    /// `daysOfWeek.weekRepeat`.
    RepeatKind, literal: None, {
        NoRepeat = -1 => "NONE",
        Weekly = 0 => "WEEKLY",
        OddWeek = 1 => "ODD_WEEK",
        EvenWeek = 2 => "EVEN_WEEK",
        NonWeekly = 3 => "NON_WEEKLY",
    }
}

pub type VolumeIncrease = Mode<VolumeIncreaseKind>;
pub type SnoozeAfterAlarm = Mode<SnoozeAfterAlarmKind>;
pub type SnoozeDuration = Mode<SnoozeDurationKind>;
pub type SnoozeLimit = Mode<SnoozeLimitKind>;
pub type DelayedStart = Mode<DelayedStartKind>;
pub type Vibrate = Mode<VibrateKind>;
pub type Captcha = Mode<CaptchaKind>;
