//! HUD five-value response scales.
//!
//! The four scales share codes but are separate types. Each one belongs to a
//! different kind of field (general, income, disability, domestic violence),
//! and keeping them apart means a rule written against one scale cannot
//! silently start matching another.

use serde::{Deserialize, Serialize};

macro_rules! define_response_scale {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "SCREAMING_SNAKE_CASE")]
        pub enum $name {
            Yes,
            No,
            ClientDoesntKnow,
            ClientRefused,
            DataNotCollected,
        }

        impl $name {
            pub fn code(self) -> u8 {
                match self {
                    $name::Yes => 1,
                    $name::No => 0,
                    $name::ClientDoesntKnow => 8,
                    $name::ClientRefused => 9,
                    $name::DataNotCollected => 99,
                }
            }

            pub fn from_code(code: u8) -> Option<Self> {
                match code {
                    1 => Some($name::Yes),
                    0 => Some($name::No),
                    8 => Some($name::ClientDoesntKnow),
                    9 => Some($name::ClientRefused),
                    99 => Some($name::DataNotCollected),
                    _ => None,
                }
            }

            /// True for the three "no answer" codes (8, 9, 99).
            pub fn is_missing(self) -> bool {
                matches!(
                    self,
                    $name::ClientDoesntKnow | $name::ClientRefused | $name::DataNotCollected
                )
            }
        }
    };
}

define_response_scale!(FivePointResponse, "General yes/no question.");
define_response_scale!(IncomeResponse, "Income from any source.");
define_response_scale!(DisabilityResponse, "Disabling condition.");
define_response_scale!(
    DomesticViolenceResponse,
    "Domestic violence survivor question."
);
