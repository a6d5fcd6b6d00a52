// vim: tw=80
mod dmmp;
mod util;

use util::dmmp;
