/// Free-text caps on appointments.
pub const MAX_LOCATION_LEN: usize = 512;
pub const MAX_DESCRIPTION_LEN: usize = 4096;

/// Hard cap on visits (cancelled included) one engineer can hold on one day.
pub const MAX_APPOINTMENTS_PER_DAY: usize = 64;

pub const MAX_DOCUMENTS_PER_RECORD: usize = 200;
pub const MAX_DOCUMENT_NAME_LEN: usize = 255;
pub const MAX_REASON_LEN: usize = 2048;
